//! Operator Gate

use async_trait::async_trait;
use scenario_capture::{OperatorGate, ScenarioSpec};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Prompts on stdout and waits for the operator to press Enter. The wait is
/// unbounded; cancellation is handled by the caller racing this against the
/// stop signal.
pub struct StdinGate;

#[async_trait]
impl OperatorGate for StdinGate {
    async fn wait_ready(&mut self, spec: &ScenarioSpec) {
        println!();
        println!(
            "=== Scenario: {} ({} s) ===",
            spec.name,
            spec.duration.as_secs()
        );
        println!("{}", spec.name.operator_instructions());
        println!("Press Enter to start...");

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        let _ = reader.read_line(&mut line).await;
    }
}
