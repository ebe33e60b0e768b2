use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use tracing::info;
use ulid::Ulid;

use slotd::config::Config;
use slotd::engine::Engine;
use slotd::model::{format_price, parse_price, RemoteBusy, SlotDefinition};

#[derive(Parser, Debug)]
#[command(name = "slotd", version, about = "Time-slot reservation store administration")]
struct Cli {
    /// Directory holding the reservation log
    #[arg(long, env = "SLOTD_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Slot catalog management
    #[command(subcommand)]
    Slots(SlotsCommand),

    /// Show which slots are free on a date (local bookings only)
    Availability { date: NaiveDate },

    /// List every booking on a date
    Bookings { date: NaiveDate },

    /// Rewrite the log as a snapshot of current state
    Compact,
}

#[derive(Subcommand, Debug)]
enum SlotsCommand {
    List {
        /// Include disabled slots
        #[arg(long)]
        all: bool,
    },
    Add {
        /// Start of day, HH:MM
        #[arg(long, value_parser = parse_time)]
        start: NaiveTime,
        /// End of day, HH:MM
        #[arg(long, value_parser = parse_time)]
        end: NaiveTime,
        /// Price such as 200.00; defaults to SLOTD_DEFAULT_PRICE_CENTS
        #[arg(long, value_parser = parse_price_arg)]
        price: Option<u32>,
    },
    /// Create the default windows that do not exist yet
    Seed,
    Enable { id: Ulid },
    Disable { id: Ulid },
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("expected HH:MM: {e}"))
}

fn parse_price_arg(s: &str) -> Result<u32, String> {
    parse_price(s).map_err(|e| e.to_string())
}

fn print_slot(slot: &SlotDefinition) {
    println!(
        "{}  {}  {:>8}  {}",
        slot.id,
        slot.label(),
        format_price(slot.price_cents),
        if slot.active { "active" } else { "disabled" }
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env());

    std::fs::create_dir_all(&cli.data_dir)?;
    let wal_path = cli.data_dir.join("slotd.wal");
    info!("opening {}", wal_path.display());
    let engine = Engine::new(wal_path, config.clone())?;

    match cli.command {
        Command::Slots(SlotsCommand::List { all }) => {
            let slots = if all {
                engine.list_slots()
            } else {
                engine.list_active_slots()
            };
            for slot in &slots {
                print_slot(slot);
            }
        }
        Command::Slots(SlotsCommand::Add { start, end, price }) => {
            let price = price.unwrap_or(config.default_slot_price_cents);
            let slot = engine.define_slot(start, end, price).await?;
            print_slot(&slot);
        }
        Command::Slots(SlotsCommand::Seed) => {
            let created = engine.seed_default_slots().await?;
            if created.is_empty() {
                println!("default slots already present");
            }
            for slot in &created {
                print_slot(slot);
            }
        }
        Command::Slots(SlotsCommand::Enable { id }) => {
            print_slot(&engine.set_slot_active(id, true).await?);
        }
        Command::Slots(SlotsCommand::Disable { id }) => {
            print_slot(&engine.set_slot_active(id, false).await?);
        }
        Command::Availability { date } => {
            let availability = engine.availability(date, RemoteBusy::not_configured()).await?;
            for sa in &availability.slots {
                println!(
                    "{}  {}  {}",
                    sa.slot.id,
                    sa.slot.label(),
                    if sa.available { "free" } else { "taken" }
                );
            }
        }
        Command::Bookings { date } => {
            for b in engine.bookings_on(date) {
                println!(
                    "{}  {}  {}  move={}  {}",
                    b.id, b.confirmation_code, b.status, b.move_id, b.phone_number
                );
            }
        }
        Command::Compact => {
            engine.compact_wal().await?;
            println!("compacted");
        }
    }

    Ok(())
}
