//! Live dashboard runtime
//!
//! Connection supervision, the participant registry, workout sessions and
//! the controller that ties them to the grid layout and render ticks.

pub mod dashboard;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod ticker;

pub use dashboard::{Dashboard, DashboardError, DeviceStatus, RenderFrame};
pub use registry::{
    Alert, GlobalStats, ParticipantCard, ParticipantId, ParticipantRegistry, RegistryError,
    SampleOutcome,
};
pub use session::{SessionAggregator, SessionError, SessionSnapshot, SessionState, SessionSummary};
pub use supervisor::{ConnectionSupervisor, LinkState, ReconnectPolicy, SupervisorEvent};
pub use ticker::{Debouncer, Ticker};
