use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use nrfdfu_ble::adapter_btleplug::{BtleplugAdapter, trigger_buttonless_dfu};
use nrfdfu_ble::{DfuController, Slot, UpdatePackage};

/// Update firmware on nRF BLE DFU targets
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE DFU target name or address
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start DFU mode using the Buttonless DFU Service
    Trigger {},
    /// Update the application only
    App {
        /// DFU package path
        pkg: String,
    },
    /// Update the SoftDevice and Bootloader
    Sdbl {
        /// DFU package path
        pkg: String,
    },
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap()
            .progress_chars("=> "),
    );
    bar
}

async fn run_package(adapter: &BtleplugAdapter, pkg: &str, slots: &[Slot]) -> anyhow::Result<()> {
    let package = UpdatePackage::open(pkg)?;
    if package.is_empty() {
        anyhow::bail!("package `{pkg}` names no updates");
    }

    let bar = progress_bar();
    let mut controller = DfuController::new(adapter);
    controller.on_progress({
        let bar = bar.clone();
        move |update| {
            bar.set_message(update.stage.clone());
            bar.set_position(update.offset as u64);
        }
    });

    controller.run_slots(&package, slots).await?;
    bar.finish_with_message("done");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let adapter = BtleplugAdapter::connect(&args.name).await?;
    match &args.command {
        Commands::Trigger {} => trigger_buttonless_dfu(&adapter).await.map_err(Into::into),
        Commands::App { pkg } => run_package(&adapter, pkg, &[Slot::Application]).await,
        Commands::Sdbl { pkg } => {
            run_package(&adapter, pkg, &[Slot::Softdevice, Slot::Bootloader, Slot::SoftdeviceBootloader]).await
        }
    }
}
