use anyhow::{Result, bail};
use lib_common::ingestors::TungsteniteConnector;
use lib_common::pens::PenDetailFeed;

use dashboard::pen_logic::{config, logger, report, session, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::Settings::resolve(config::load_config())?;
    logger::setup_logging(&settings.log_dir, &settings.log_level, "pen_detail")?;

    let Some(pen_id) = settings.pen_id.clone() else {
        bail!("No pen selected: pass --pen-id or set PEN_ID");
    };
    log::info!("Following pen {} on {}", pen_id, settings.api_base_url);

    let api = session::connect(&settings).await?;
    let feed = PenDetailFeed::start(&api, &pen_id, TungsteniteConnector)?;
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
                log::info!("Pen {}: {} points (stream {:?})", view.pen_id, view.points.len(), feed.connection_state());
                for line in report::detail_lines(&view) {
                    log::info!("{}", line);
                }
            }
        }
    }

    feed.close();
    log::info!("Shutdown complete.");
    Ok(())
}
