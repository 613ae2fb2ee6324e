// Pulseboard - Live Multi-Participant Heart-Rate Dashboard

pub mod ble;
pub mod config;
pub mod layout;
pub mod live;
pub mod membership;
pub mod storage;
pub mod zones;

pub use config::{ConfigError, DashboardConfig};
pub use layout::{compute_grid, GridConfiguration, GridLayout, LayoutConfig, Viewport};
pub use live::{Dashboard, DashboardError, RenderFrame};
pub use zones::{Zone, ZoneTable};
