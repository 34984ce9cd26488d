//! # Live Pen Feeds
//!
//! The two consumers of the sync layer. Each one fetches a snapshot and
//! opens the matching push channel at the same time, merges both into a
//! view, and publishes every change on a `tokio::sync::watch` channel.
//!
//! - [`DashboardFeed`]: the pen list, replaced wholesale by every message.
//! - [`PenDetailFeed`]: one pen's rolling time-series window.
//!
//! A stream message always describes newer data than the snapshot, so a
//! snapshot that arrives after the first stream message is discarded.
//! Closing a feed (or dropping it) cancels the snapshot fetch and the stream.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::api::PenApi;
use super::auth::TokenSource;
use super::model::{decode_piggeries, Piggery};
use super::timeseries::{PointSample, RollingWindow, TimeSeriesPoint};
use crate::ingestors::{
    ConnectionState, Connector, ResilientWs, StreamHandle, StreamHandler, StreamPayload,
};
use crate::retrieve::{RetrieveError, Transport};

/// Merge state behind a feed, published as a cloneable view.
pub trait FeedState: Send + 'static {
    /// The published snapshot of the state.
    type View: Clone + Send + Sync + 'static;

    /// Renders the current view.
    fn view(&self) -> Self::View;

    /// Ends the loading phase. Returns whether it was still loading.
    fn finish_loading(&mut self) -> bool;
}

/// What the pen list screen shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    /// True until the snapshot fetch has finished, successfully or not.
    pub loading: bool,
    /// All piggeries, in server order.
    pub piggeries: Vec<Piggery>,
    /// Identifier of the selected piggery.
    pub active_piggery: Option<String>,
}

impl Default for DashboardView {
    fn default() -> Self {
        Self {
            loading: true,
            piggeries: Vec::new(),
            active_piggery: None,
        }
    }
}

impl DashboardView {
    /// The selected piggery, if it still exists.
    pub fn active(&self) -> Option<&Piggery> {
        let id = self.active_piggery.as_deref()?;
        self.piggeries.iter().find(|p| p.piggery_id == id)
    }
}

/// Merge state of the pen list.
#[derive(Debug, Default)]
pub struct DashboardState {
    view: DashboardView,
    streamed: bool,
}

impl DashboardState {
    /// Applies the snapshot. Returns false when a stream message already
    /// superseded it.
    pub fn apply_snapshot(&mut self, piggeries: Vec<Piggery>) -> bool {
        if self.streamed {
            log::debug!("Discarding pen list snapshot older than the stream");
            return false;
        }
        if self.view.active_piggery.is_none() {
            self.view.active_piggery = piggeries.first().map(|p| p.piggery_id.clone());
        }
        self.view.piggeries = piggeries;
        true
    }

    /// Replaces the list with a streamed message. Messages that are not
    /// JSON objects are dropped.
    pub fn apply_stream(&mut self, payload: &StreamPayload) -> bool {
        let Some(value) = payload.as_json().filter(|v| v.is_object()) else {
            log::debug!("Dropping malformed pen list message");
            return false;
        };
        let piggeries = decode_piggeries(value);
        let keep_active = self
            .view
            .active_piggery
            .as_deref()
            .is_some_and(|id| piggeries.iter().any(|p| p.piggery_id == id));
        if !keep_active {
            self.view.active_piggery = piggeries.first().map(|p| p.piggery_id.clone());
        }
        self.view.piggeries = piggeries;
        self.streamed = true;
        true
    }

    /// Selects a piggery; unknown identifiers are ignored.
    pub fn select(&mut self, piggery_id: &str) -> bool {
        if !self.view.piggeries.iter().any(|p| p.piggery_id == piggery_id) {
            return false;
        }
        self.view.active_piggery = Some(piggery_id.to_string());
        true
    }
}

impl FeedState for DashboardState {
    type View = DashboardView;

    fn view(&self) -> DashboardView {
        self.view.clone()
    }

    fn finish_loading(&mut self) -> bool {
        std::mem::replace(&mut self.view.loading, false)
    }
}

/// What the pen detail screen shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailView {
    /// Pen being shown.
    pub pen_id: String,
    /// True until the snapshot fetch has finished, successfully or not.
    pub loading: bool,
    /// The window, oldest point first.
    pub points: Vec<TimeSeriesPoint>,
}

/// Merge state of one pen's time series.
#[derive(Debug)]
pub struct DetailState {
    pen_id: String,
    window: RollingWindow,
    loading: bool,
    streamed: bool,
}

impl DetailState {
    /// Empty state for `pen_id`.
    pub fn new(pen_id: impl Into<String>) -> Self {
        Self {
            pen_id: pen_id.into(),
            window: RollingWindow::new(),
            loading: true,
            streamed: false,
        }
    }

    /// Seeds the window from the snapshot. Returns false when a stream
    /// message already superseded it.
    pub fn apply_snapshot(&mut self, samples: Vec<PointSample>) -> bool {
        if self.streamed {
            log::debug!("Discarding pen {} snapshot older than the stream", self.pen_id);
            return false;
        }
        self.window = RollingWindow::from_samples(samples);
        true
    }

    /// Appends a streamed measurement; malformed messages are dropped.
    pub fn apply_stream(&mut self, payload: &StreamPayload) -> Option<TimeSeriesPoint> {
        let point = self.window.apply_payload(payload);
        match point {
            Some(_) => self.streamed = true,
            None => log::debug!("Dropping malformed message for pen {}", self.pen_id),
        }
        point
    }

    /// The merged window.
    pub fn window(&self) -> &RollingWindow {
        &self.window
    }
}

impl FeedState for DetailState {
    type View = DetailView;

    fn view(&self) -> DetailView {
        DetailView {
            pen_id: self.pen_id.clone(),
            loading: self.loading,
            points: self.window.to_vec(),
        }
    }

    fn finish_loading(&mut self) -> bool {
        std::mem::replace(&mut self.loading, false)
    }
}

/// Shared state plus the channel its views are published on.
struct FeedCell<S: FeedState> {
    state: Mutex<S>,
    tx: watch::Sender<S::View>,
}

impl<S: FeedState> FeedCell<S> {
    fn new(state: S) -> Arc<Self> {
        let (tx, _) = watch::channel(state.view());
        Arc::new(Self {
            state: Mutex::new(state),
            tx,
        })
    }

    /// Runs `change` under the lock and publishes when it reports a change.
    fn update(&self, change: impl FnOnce(&mut S) -> bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = change(&mut state);
        if changed {
            self.tx.send_replace(state.view());
        }
        changed
    }
}

struct FeedSink<S: FeedState> {
    label: &'static str,
    cell: Arc<FeedCell<S>>,
    merge: fn(&mut S, &StreamPayload) -> bool,
}

impl<S: FeedState> StreamHandler for FeedSink<S> {
    fn on_message(&mut self, payload: StreamPayload) {
        let merge = self.merge;
        self.cell.update(|state| merge(state, &payload));
    }

    fn on_open(&mut self) {
        log::info!("{} stream open", self.label);
    }

    fn on_close(&mut self) {
        log::warn!("{} stream lost", self.label);
    }
}

/// A running feed: the snapshot task, the stream and the published view.
struct Feed<S: FeedState> {
    cell: Arc<FeedCell<S>>,
    cancel: CancellationToken,
    stream: StreamHandle,
}

impl<S: FeedState> Feed<S> {
    fn start<C, R, Fut>(
        label: &'static str,
        state: S,
        stream: ResilientWs<C>,
        merge: fn(&mut S, &StreamPayload) -> bool,
        fetch: impl FnOnce(CancellationToken) -> Fut,
        seed: fn(&mut S, R) -> bool,
    ) -> Self
    where
        C: Connector,
        R: Send + 'static,
        Fut: Future<Output = Result<R, RetrieveError>> + Send + 'static,
    {
        let cell = FeedCell::new(state);
        let cancel = CancellationToken::new();

        let snapshot = fetch(cancel.clone());
        let snapshot_cell = Arc::clone(&cell);
        let closed = cancel.clone();
        tokio::spawn(async move {
            let outcome = snapshot.await;
            snapshot_cell.update(|s| {
                if closed.is_cancelled() {
                    return false;
                }
                match outcome {
                    Ok(data) => {
                        let seeded = seed(s, data);
                        s.finish_loading() || seeded
                    }
                    Err(e) => {
                        log::error!("{} snapshot failed: {}", label, e);
                        s.finish_loading()
                    }
                }
            });
        });

        let stream = stream.spawn(FeedSink {
            label,
            cell: Arc::clone(&cell),
            merge,
        });

        Self {
            cell,
            cancel,
            stream,
        }
    }

    fn close(&self) {
        self.cancel.cancel();
        self.stream.close();
        // Wait out a snapshot update already in progress.
        drop(self.cell.state.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Live pen list.
pub struct DashboardFeed {
    inner: Feed<DashboardState>,
}

impl DashboardFeed {
    /// Starts the snapshot fetch and the pen list stream.
    ///
    /// Fails without touching the network when no token is available.
    pub fn start<S, T, C>(api: &Arc<PenApi<S, T>>, connector: C) -> Result<Self, RetrieveError>
    where
        S: TokenSource + 'static,
        T: Transport + 'static,
        C: Connector,
    {
        let stream = ResilientWs::new(api.pens_stream_url()?)
            .policy(api.reconnect_policy())
            .connector(connector);
        let api = Arc::clone(api);
        let inner = Feed::start(
            "Pen list",
            DashboardState::default(),
            stream,
            DashboardState::apply_stream,
            |cancel| async move { api.fetch_pens(&cancel).await },
            DashboardState::apply_snapshot,
        );
        Ok(Self { inner })
    }

    /// The current view.
    pub fn view(&self) -> DashboardView {
        self.inner.cell.tx.borrow().clone()
    }

    /// A receiver notified on every view change.
    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.inner.cell.tx.subscribe()
    }

    /// Selects the piggery to show; unknown identifiers are ignored.
    pub fn select_piggery(&self, piggery_id: &str) -> bool {
        self.inner.cell.update(|s| s.select(piggery_id))
    }

    /// State of the underlying stream.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.stream.state()
    }

    /// Stops the fetch and the stream. No view change is published afterwards.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Live time series of one pen.
pub struct PenDetailFeed {
    inner: Feed<DetailState>,
}

impl PenDetailFeed {
    /// Starts the snapshot fetch and the pen's stream.
    ///
    /// Fails without touching the network when no token is available.
    pub fn start<S, T, C>(
        api: &Arc<PenApi<S, T>>,
        pen_id: &str,
        connector: C,
    ) -> Result<Self, RetrieveError>
    where
        S: TokenSource + 'static,
        T: Transport + 'static,
        C: Connector,
    {
        let stream = ResilientWs::new(api.pen_stream_url(pen_id)?)
            .policy(api.reconnect_policy())
            .connector(connector);
        let api = Arc::clone(api);
        let id = pen_id.to_string();
        let inner = Feed::start(
            "Pen detail",
            DetailState::new(pen_id),
            stream,
            |state, payload| state.apply_stream(payload).is_some(),
            |cancel| async move { api.fetch_pen_detail(&id, &cancel).await },
            DetailState::apply_snapshot,
        );
        Ok(Self { inner })
    }

    /// The current view.
    pub fn view(&self) -> DetailView {
        self.inner.cell.tx.borrow().clone()
    }

    /// A receiver notified on every view change.
    pub fn subscribe(&self) -> watch::Receiver<DetailView> {
        self.inner.cell.tx.subscribe()
    }

    /// State of the underlying stream.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.stream.state()
    }

    /// Stops the fetch and the stream. No view change is published afterwards.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<S: FeedState> Drop for Feed<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list(ids: &[&str]) -> StreamPayload {
        let piggeries: Vec<_> = ids.iter().map(|id| json!({"piggery_id": id})).collect();
        StreamPayload::Json(json!({ "piggeries": piggeries }))
    }

    fn piggeries(ids: &[&str]) -> Vec<Piggery> {
        decode_piggeries(list(ids).as_json().unwrap())
    }

    #[test]
    fn test_snapshot_selects_first_piggery() {
        let mut state = DashboardState::default();
        assert!(state.view().loading);

        assert!(state.apply_snapshot(piggeries(&["A", "B"])));
        state.finish_loading();

        let view = state.view();
        assert!(!view.loading);
        assert_eq!(view.active_piggery.as_deref(), Some("A"));
        assert_eq!(view.active().unwrap().piggery_id, "A");
    }

    #[test]
    fn test_stream_keeps_selection_while_it_exists() {
        let mut state = DashboardState::default();
        state.apply_snapshot(piggeries(&["A", "B"]));
        assert!(state.select("B"));
        assert!(!state.select("Z"));

        state.apply_stream(&list(&["A", "B", "C"]));
        assert_eq!(state.view().active_piggery.as_deref(), Some("B"));

        state.apply_stream(&list(&["C", "A"]));
        assert_eq!(state.view().active_piggery.as_deref(), Some("C"));

        state.apply_stream(&list(&[]));
        assert_eq!(state.view().active_piggery, None);
        assert!(state.view().active().is_none());
    }

    #[test]
    fn test_snapshot_after_stream_is_discarded() {
        let mut state = DashboardState::default();
        assert!(state.apply_stream(&list(&["NEW"])));
        assert!(!state.apply_snapshot(piggeries(&["OLD"])));
        assert_eq!(state.view().piggeries[0].piggery_id, "NEW");

        let mut detail = DetailState::new("3");
        detail.apply_stream(&StreamPayload::Json(json!({"activity": 9})));
        assert!(!detail.apply_snapshot(vec![PointSample::default(); 4]));
        assert_eq!(detail.view().points.len(), 1);
        assert_eq!(detail.view().points[0].index, 1);
    }

    #[test]
    fn test_malformed_list_message_is_dropped() {
        let mut state = DashboardState::default();
        state.apply_snapshot(piggeries(&["A"]));

        assert!(!state.apply_stream(&StreamPayload::Raw("oops".into())));
        assert!(!state.apply_stream(&StreamPayload::Json(json!([1]))));
        assert_eq!(state.view().piggeries.len(), 1);

        // A malformed message does not count as newer data either.
        let mut fresh = DashboardState::default();
        fresh.apply_stream(&StreamPayload::Json(json!("oops")));
        assert!(fresh.apply_snapshot(piggeries(&["A"])));
    }

    #[test]
    fn test_detail_snapshot_then_stream() {
        let mut state = DetailState::new("3");
        assert!(state.apply_snapshot(vec![PointSample { activity: 1.0, feeding_time: 1.0 }]));
        state.finish_loading();

        let point = state
            .apply_stream(&StreamPayload::Json(json!({"activity": 2, "feeding_time": 2})))
            .unwrap();
        assert_eq!(point.index, 2);

        let view = state.view();
        assert!(!view.loading);
        assert_eq!(view.pen_id, "3");
        assert_eq!(
            view.points,
            vec![
                TimeSeriesPoint { index: 1, activity: 1.0, feeding_time: 1.0 },
                TimeSeriesPoint { index: 2, activity: 2.0, feeding_time: 2.0 },
            ]
        );
    }

    #[test]
    fn test_feed_cell_publishes_only_changes() {
        let cell = FeedCell::new(DashboardState::default());
        let mut rx = cell.tx.subscribe();

        assert!(!cell.update(|s| s.select("missing")));
        assert!(!rx.has_changed().unwrap());

        assert!(cell.update(|s| s.apply_stream(&list(&["A"]))));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().piggeries.len(), 1);
    }
}
