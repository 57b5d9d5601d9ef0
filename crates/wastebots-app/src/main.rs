use anyhow::Result;
use tracing::{info, warn};
use wastebots_core::{Colony, ColonyConfig, RunObserver, RunOutcome, TickStats};

const TICK_BUDGET: u64 = 10_000;
const REPORT_INTERVAL: u64 = 50;

fn main() -> Result<()> {
    init_tracing();
    let config = ColonyConfig {
        rng_seed: Some(0xFACA_DE00_0123_4567),
        ..ColonyConfig::default()
    };
    info!(
        width = config.grid_width,
        height = config.grid_height,
        zones = config.zone_count,
        waste = config.waste_total,
        policy = ?config.policy,
        "Starting wastebots colony"
    );

    let mut colony = Colony::with_observer(config, Box::new(ProgressReporter))?;
    let outcome = colony.run_while(TICK_BUDGET);
    report(&colony, outcome);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn report(colony: &Colony, outcome: RunOutcome) {
    let snapshot = colony.snapshot();
    let messages = colony.messages_sent();
    match outcome {
        RunOutcome::Completed { ticks } => info!(
            ticks,
            recycled = snapshot.recycled,
            units_left = colony.live_units(),
            msgs_green = messages.green,
            msgs_yellow = messages.yellow,
            msgs_red = messages.red,
            "Colony cleared the grid"
        ),
        RunOutcome::TickLimit { ticks } => warn!(
            ticks,
            on_grid = snapshot.wastes.len(),
            recycled = snapshot.recycled,
            "Tick budget exhausted before cleanup finished"
        ),
    }
}

/// Emits a progress line every `REPORT_INTERVAL` ticks.
struct ProgressReporter;

impl RunObserver for ProgressReporter {
    fn on_tick(&mut self, stats: &TickStats) {
        if stats.tick.0.is_multiple_of(REPORT_INTERVAL) {
            info!(
                tick = stats.tick.0,
                on_grid = stats.on_grid.total(),
                carried = stats.carried,
                recycled = stats.recycled,
                rejected = stats.rejected,
                "progress"
            );
        }
    }
}
