use lib_common::pens::{DashboardView, DetailView, Pen};

pub fn pen_line(pen: &Pen) -> String {
    format!(
        "{} ({}): pigs={:.0} activity={:.2} feeding={:.1}min temp={:.1}C abnormal={} detail=/pens/{}",
        pen.pen_name,
        pen.pen_id,
        pen.current_pig_count,
        pen.avg_activity_level,
        pen.avg_feeding_time_minutes,
        pen.avg_temperature_celsius,
        pen.abnormal_pigs.len(),
        pen.detail_param()
    )
}

/// Summary of the active piggery followed by one line per pen.
pub fn dashboard_lines(view: &DashboardView) -> Vec<String> {
    if view.loading && view.piggeries.is_empty() {
        return vec!["Loading pens...".to_string()];
    }
    let Some(piggery) = view.active() else {
        return vec![format!("No piggery to show ({} received)", view.piggeries.len())];
    };

    let mut lines = Vec::with_capacity(piggery.pens.len() + 1);
    lines.push(format!(
        "{} [{}]: {} pens, {:.0} pigs, {} abnormal",
        piggery.piggery_name,
        piggery.piggery_id,
        piggery.pens.len(),
        piggery.total_pigs,
        piggery.abnormal_count()
    ));
    lines.extend(piggery.pens.iter().map(pen_line));
    lines
}

/// One line per point of the window, oldest first.
pub fn detail_lines(view: &DetailView) -> Vec<String> {
    if view.points.is_empty() {
        let state = if view.loading { "loading" } else { "no data yet" };
        return vec![format!("Pen {}: {}", view.pen_id, state)];
    }
    view.points
        .iter()
        .map(|p| {
            format!(
                "Pen {} #{}: activity={:.2} feeding_time={:.2}",
                view.pen_id, p.index, p.activity, p.feeding_time
            )
        })
        .collect()
}
