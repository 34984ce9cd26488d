use anyhow::Result;
use lib_common::ingestors::TungsteniteConnector;
use lib_common::pens::DashboardFeed;

use dashboard::pen_logic::{config, logger, report, session, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::Settings::resolve(config::load_config())?;
    logger::setup_logging(&settings.log_dir, &settings.log_level, "pen_dashboard")?;
    log::info!("Starting pen dashboard against {}", settings.api_base_url);

    let api = session::connect(&settings).await?;
    let feed = DashboardFeed::start(&api, TungsteniteConnector)?;
    let mut views = feed.subscribe();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                for line in report::dashboard_lines(&view) {
                    log::info!("{}", line);
                }
            }
        }
    }

    feed.close();
    log::info!("Shutdown complete.");
    Ok(())
}
