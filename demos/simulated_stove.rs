//! Coordinator against a simulated stove
//!
//! Run with: cargo run --example simulated_stove
//!
//! Set `RUST_LOG=aduro_stove=debug` for the coordinator's own logging.

use aduro_stove::{
    CoordinatorConfig, DiscoveryInfo, MemoryStore, OperationMode, Result, StoveAddress,
    StoveCoordinator, StoveTransport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Simulated stove state, advanced on every operating frame read.
struct Simulation {
    state: u16,
    operation_mode: u8,
    power_pct: f64,
    room_temp: f64,
    target_temp: f64,
    smoke_temp: f64,
    consumed_today: f64,
}

impl Simulation {
    fn new() -> Self {
        Self {
            state: 5,
            operation_mode: 0,
            power_pct: 50.0,
            room_temp: 19.0,
            target_temp: 21.0,
            smoke_temp: 150.0,
            consumed_today: 0.0,
        }
    }

    /// One simulated minute.
    fn step(&mut self) {
        if self.state == 5 {
            let burn = self.power_pct / 100.0 * 1.2 / 60.0;
            self.consumed_today += burn;
            self.room_temp += self.power_pct / 100.0 * 0.05;
            self.smoke_temp = 100.0 + self.power_pct * 1.5;
        } else {
            self.room_temp -= 0.02;
            self.smoke_temp = (self.smoke_temp - 5.0).max(20.0);
        }
    }

    fn operating_frame(&self) -> String {
        let mut fields = vec!["0".to_string(); 122];
        fields[0] = format!("{:.1}", self.room_temp);
        fields[1] = format!("{:.1}", self.target_temp);
        fields[6] = self.state.to_string();
        fields[37] = format!("{:.1}", self.smoke_temp);
        fields[99] = format!("{:.0}", self.power_pct);
        fields.join(",")
    }

    fn status_frame(&self) -> String {
        let mut fields = vec!["0".to_string(); 20];
        fields[8] = format!("{:.2}", 1200.0 + self.consumed_today);
        fields[16] = self.operation_mode.to_string();
        fields.join(",")
    }

    fn counter_series(&self, key: &str) -> String {
        let len = if key == "total_years" { 20 } else { 31 };
        let values: Vec<String> = (0..len)
            .map(|_| format!("{:.2}", self.consumed_today))
            .collect();
        format!("{}={}", key, values.join(","))
    }
}

struct SimulatedTransport {
    sim: Mutex<Simulation>,
}

#[async_trait]
impl StoveTransport for SimulatedTransport {
    async fn discover(&self) -> Result<DiscoveryInfo> {
        Ok(DiscoveryInfo {
            host: "127.0.0.1".to_string(),
            firmware_version: Some("sim".to_string()),
            firmware_build: Some("1".to_string()),
        })
    }

    async fn read(&self, _address: &StoveAddress, function_id: u8, payload: &str) -> Result<String> {
        let mut sim = self.sim.lock();
        let reply = match (function_id, payload) {
            (11, "*") => sim.status_frame(),
            (11, _) => {
                sim.step();
                sim.operating_frame()
            }
            (1, _) => "wifi.router=SimNet,,,,127.0.0.1,127.0.0.1,-50,,,00:00:00:00:00:00".to_string(),
            (_, key) => sim.counter_series(key),
        };
        Ok(reply)
    }

    async fn write(&self, _address: &StoveAddress, path: &str, value: &str) -> Result<String> {
        let mut sim = self.sim.lock();
        match path {
            "regulation.operation_mode" => sim.operation_mode = value.parse().unwrap_or(0),
            "regulation.fixed_power" => sim.power_pct = value.parse().unwrap_or(50.0),
            "boiler.temp" => sim.target_temp = value.parse().unwrap_or(21.0),
            "misc.start" => sim.state = 5,
            "misc.stop" => sim.state = 14,
            _ => return Ok(format!("unknown path {}", path)),
        }
        println!("  -> stove accepted {}={}", path, value);
        Ok(String::new())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("aduro_stove=info".parse().unwrap()))
        .init();

    println!("Simulated Aduro Stove");
    println!("=====================\n");

    let transport = Arc::new(SimulatedTransport {
        sim: Mutex::new(Simulation::new()),
    });
    let config = CoordinatorConfig::new("sim-0001", "0000")
        .with_poll_intervals(Duration::from_secs(2), Duration::from_millis(500))
        .with_settle_delay(Duration::from_millis(200));
    let coordinator = StoveCoordinator::new(config, transport, Arc::new(MemoryStore::new())).await;

    let _handle = coordinator.on_snapshot(|snapshot| {
        let t = &snapshot.telemetry;
        println!(
            "[{}] state {} mode {} HL {} room {:.1}°C smoke {:.0}°C | {:.2} kg left ({:.0}%){}",
            snapshot.updated_at.format("%H:%M:%S"),
            t.state,
            t.operation_mode,
            t.heatlevel,
            t.room_temp,
            t.smoke_temp,
            snapshot.fuel_remaining,
            snapshot.fuel_percentage,
            if snapshot.pending.change_in_progress {
                " (change pending)"
            } else {
                ""
            }
        );
    });

    coordinator.start();
    tokio::time::sleep(Duration::from_secs(3)).await;

    println!("\nRaising heat level to 3...");
    coordinator.set_heatlevel(3).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    println!("\nSwitching to temperature mode at 22.5°C...");
    coordinator.set_temperature(22.5).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let prediction = coordinator.predict_depletion().await?;
    println!("\nPrediction: {}", prediction.report());

    if coordinator.telemetry().map(|t| t.operation_mode) == Some(OperationMode::Temperature) {
        println!("\nBack to heat level mode...");
        coordinator.toggle_mode().await?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("\nExiting..."),
        _ = tokio::time::sleep(Duration::from_secs(10)) => println!("\nDone."),
    }

    coordinator.stop().await;
    Ok(())
}
