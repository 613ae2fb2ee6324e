// src/bin/pulseboard_sim.rs
//! Runs the live dashboard against simulated heart-rate straps.
//!
//! Each strap random-walks around a target heart rate and now and then
//! drops its link, so reconnection and stale cards can be watched in the log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use uuid::Uuid;

use pulseboard::ble::simulated::{SimSensor, SimSensorNetwork};
use pulseboard::layout::Viewport;
use pulseboard::live::Dashboard;
use pulseboard::membership::{InMemoryDirectory, MemberProfile};
use pulseboard::storage::{
    DeviceAssociations, InMemorySessionStore, JsonlSessionStore, SessionStore,
};
use pulseboard::DashboardConfig;

#[derive(Parser, Debug)]
#[command(name = "pulseboard-sim", about = "Simulated multi-participant heart-rate dashboard")]
struct Args {
    /// Number of simulated straps
    #[arg(long, default_value_t = 6)]
    sensors: usize,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 30)]
    seconds: u64,

    /// Dashboard configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for session records; kept in memory when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Chance per second that a strap loses its link
    #[arg(long, default_value_t = 0.02)]
    drop_rate: f64,

    /// Viewport as WIDTHxHEIGHT
    #[arg(long, default_value = "1920x1080")]
    viewport: String,
}

const NAMES: [&str; 8] = ["Ana", "Ben", "Chidi", "Dana", "Eli", "Fern", "Gus", "Hana"];

fn parse_viewport(s: &str) -> anyhow::Result<Viewport> {
    let (w, h) = s
        .split_once('x')
        .with_context(|| format!("viewport must look like 1920x1080, got {}", s))?;
    Ok(Viewport::new(w.trim().parse()?, h.trim().parse()?))
}

/// Drive one strap until the task is aborted.
async fn run_strap(sensor: SimSensor, target: f64, drop_rate: f64) {
    let mut bpm = target;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let (step, drop) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-4.0..=4.0), rng.gen_bool(drop_rate.clamp(0.0, 1.0)))
        };
        bpm = (bpm + step + (target - bpm) * 0.1).clamp(45.0, 200.0);

        if drop {
            log::info!("Strap {} drifting out of range", sensor.id());
            sensor.drop_link().await;
            continue;
        }
        if let Err(e) = sensor.send_heart_rate(bpm.round() as u16).await {
            log::debug!("Strap {} not linked: {}", sensor.id(), e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DashboardConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DashboardConfig::default(),
    };

    let (store, associations): (Arc<dyn SessionStore>, Option<DeviceAssociations>) =
        match &args.data_dir {
            Some(dir) => {
                let table = DeviceAssociations::load(&dir.join("associations.json"))?;
                (Arc::new(JsonlSessionStore::new(dir.join("sessions"))), Some(table))
            }
            None => (Arc::new(InMemorySessionStore::new()), None),
        };

    let network = SimSensorNetwork::new();
    let directory = Arc::new(InMemoryDirectory::new().with_latency(Duration::from_millis(300)));
    let dashboard = Dashboard::new(config, network.clone(), directory.clone(), store, associations);
    dashboard.set_viewport(parse_viewport(&args.viewport)?).await;
    dashboard.start().await;

    let mut straps = Vec::new();
    let mut participants = Vec::new();
    for i in 0..args.sensors {
        let name = NAMES[i % NAMES.len()];
        let sensor = network.add_sensor(&format!("HRM-{}", name)).await;
        let participant = Uuid::new_v4();
        let age = (25 + (i * 7) % 30) as u8;
        directory
            .insert(participant, MemberProfile::new(name).with_age(age))
            .await;

        dashboard
            .connect_device(Some(sensor.descriptor().await), Some(participant))
            .await
            .with_context(|| format!("connecting {}", name))?;
        participants.push(participant);

        let target = 95.0 + (i as f64 * 13.0) % 70.0;
        straps.push(tokio::spawn(run_strap(sensor, target, args.drop_rate)));
    }

    if let Some(first) = participants.first() {
        dashboard.start_session(*first).await?;
    }

    let mut frames = dashboard.subscribe();
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    let stale = frame.cards.iter().filter(|c| c.stale).count();
                    log::info!(
                        "{} cards, {} active, avg {:?} bpm, {} stale, layout {:?}",
                        frame.cards.len(),
                        frame.stats.active,
                        frame.stats.average_heart_rate,
                        stale,
                        frame.layout.grid().map(|g| (g.columns, g.rows))
                    );
                    for card in &frame.cards {
                        log::debug!(
                            "  {:<8} {:>4?} bpm {:<10} {:?}",
                            card.name,
                            card.heart_rate,
                            card.zone_label,
                            card.alert
                        );
                    }
                }
                Err(e) => log::warn!("Render frames lagging: {}", e),
            },
            _ = &mut deadline => break,
        }
    }

    if !participants.is_empty() {
        let summary = dashboard.stop_session().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    for strap in straps {
        strap.abort();
    }
    dashboard.stop().await;
    Ok(())
}
