//! Windowing primitives: assigners, watermarks, and the keyed windowed
//! state machines behind the aggregate and join nodes.
//!
//! A window assigner maps an item timestamp to the set of windows the item
//! belongs to. Windows close when the watermark passes their end; late items
//! within the allowed lateness either update the window, go to the side
//! channel, or are dropped per policy; beyond that they are dropped and
//! counted.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ack::AckHandle;
use crate::error::{duration_millis, EngineError};
use crate::message::Envelope;

/// Half-open event-time interval `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn intersects(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn merge(&self, other: &Window) -> Window {
        Window {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Maps an item timestamp to the windows it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowAssigner {
    /// Non-overlapping fixed-size windows.
    Tumbling {
        #[serde(with = "duration_millis")]
        size: Duration,
    },
    /// Fixed-size windows opening every `slide`.
    Sliding {
        #[serde(with = "duration_millis")]
        size: Duration,
        #[serde(with = "duration_millis")]
        slide: Duration,
    },
    /// Per-key windows separated by an inactivity gap; overlapping session
    /// windows merge inside the windowed state.
    Session {
        #[serde(with = "duration_millis")]
        gap: Duration,
    },
}

impl WindowAssigner {
    pub fn tumbling(size: Duration) -> Self {
        WindowAssigner::Tumbling { size }
    }

    pub fn sliding(size: Duration, slide: Duration) -> Self {
        WindowAssigner::Sliding { size, slide }
    }

    pub fn session(gap: Duration) -> Self {
        WindowAssigner::Session { gap }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, WindowAssigner::Session { .. })
    }

    /// The windows a timestamp falls into. Session assignment yields the
    /// seed window `[ts, ts + gap)`; merging happens in the windowed state.
    pub fn assign(&self, ts: i64) -> Vec<Window> {
        match self {
            WindowAssigner::Tumbling { size } => {
                let size = size.as_millis() as i64;
                let start = ts - ts.rem_euclid(size);
                vec![Window { start, end: start + size }]
            }
            WindowAssigner::Sliding { size, slide } => {
                let size = size.as_millis() as i64;
                let slide = slide.as_millis() as i64;
                let mut windows = Vec::new();
                let mut start = ts - ts.rem_euclid(slide);
                while start + size > ts {
                    windows.push(Window { start, end: start + size });
                    start -= slide;
                }
                windows
            }
            WindowAssigner::Session { gap } => {
                let gap = gap.as_millis() as i64;
                vec![Window { start: ts, end: ts + gap }]
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            WindowAssigner::Tumbling { size } => {
                if size.is_zero() {
                    return Err("tumbling window size must be positive".into());
                }
            }
            WindowAssigner::Sliding { size, slide } => {
                if size.is_zero() || slide.is_zero() {
                    return Err("sliding window size and slide must be positive".into());
                }
                if slide > size {
                    return Err("sliding window slide must not exceed its size".into());
                }
            }
            WindowAssigner::Session { gap } => {
                if gap.is_zero() {
                    return Err("session gap must be positive".into());
                }
            }
        }
        Ok(())
    }
}

/// Which clock drives the windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeMode {
    /// The engine clock at item arrival.
    Processing,
    /// Item event time; requires every upstream source to assign event
    /// times, checked at validation.
    EventTime,
}

/// What happens to an item arriving after its window closed but within the
/// allowed lateness. Items past the allowed lateness are always dropped and
/// counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Drop and count.
    Drop,
    /// Route to the dead-letter side channel.
    SideOutput,
    /// Fold into the window and re-emit the updated result.
    Update,
}

/// Windowing configuration carried by aggregate and join nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub assigner: WindowAssigner,
    pub time_mode: TimeMode,
    #[serde(with = "duration_millis")]
    pub allowed_lateness: Duration,
    pub late_policy: LatePolicy,
}

impl WindowConfig {
    pub fn event_time(assigner: WindowAssigner) -> Self {
        Self {
            assigner,
            time_mode: TimeMode::EventTime,
            allowed_lateness: Duration::ZERO,
            late_policy: LatePolicy::Drop,
        }
    }

    pub fn processing_time(assigner: WindowAssigner) -> Self {
        Self {
            assigner,
            time_mode: TimeMode::Processing,
            allowed_lateness: Duration::ZERO,
            late_policy: LatePolicy::Drop,
        }
    }

    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness = lateness;
        self
    }

    pub fn with_late_policy(mut self, policy: LatePolicy) -> Self {
        self.late_policy = policy;
        self
    }
}

/// Derives a monotone watermark from observed event times minus the
/// configured out-of-orderness bound. Source drivers run one of these and
/// emit [`crate::message::Message::Watermark`] whenever it advances.
#[derive(Debug)]
pub struct WatermarkGenerator {
    out_of_orderness: i64,
    max_ts: Option<i64>,
    last_emitted: Option<i64>,
}

impl WatermarkGenerator {
    pub fn new(out_of_orderness: Duration) -> Self {
        Self {
            out_of_orderness: out_of_orderness.as_millis() as i64,
            max_ts: None,
            last_emitted: None,
        }
    }

    /// Observe an item's event time; returns the new watermark when it
    /// advanced.
    pub fn observe(&mut self, ts: i64) -> Option<i64> {
        let max = self.max_ts.map_or(ts, |m| m.max(ts));
        self.max_ts = Some(max);
        let wm = max - self.out_of_orderness;
        match self.last_emitted {
            Some(last) if wm <= last => None,
            _ => {
                self.last_emitted = Some(wm);
                Some(wm)
            }
        }
    }
}

/// Result of feeding one event into a windowed state machine.
#[derive(Debug, Default)]
pub struct StateOutput {
    /// Window results to emit downstream, ordered by window start.
    pub emit: Vec<Envelope>,
    /// Late items for the dead-letter side channel.
    pub side: Vec<Envelope>,
    /// Watermark to forward downstream, already combined across inputs.
    pub forward_watermark: Option<i64>,
    /// Acknowledgment handles of items that will never contribute to an
    /// emission (dropped lates, unmatched inner-join panes).
    pub acks_to_resolve: Vec<AckHandle>,
}

/// Erased keyed windowed operator driven by the scheduler. Input `0` is the
/// only input for aggregates; joins use `0` (left) and `1` (right).
pub trait WindowedState: Send {
    fn on_item(&mut self, input: usize, env: Envelope, proc_now_ms: i64) -> Result<StateOutput, EngineError>;
    fn on_watermark(&mut self, input: usize, watermark: i64) -> StateOutput;
    /// Called once per input at end of stream; the final call flushes every
    /// remaining window.
    fn on_eos(&mut self, input: usize) -> StateOutput;
    fn late_drops(&self) -> u64;
}

/// One emitted aggregate: the key, the window it was computed over, and the
/// folded accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedAggregate<K, A> {
    pub key: K,
    pub window: Window,
    pub value: A,
}

struct Pane<T> {
    window: Window,
    items: Vec<T>,
    acks: Vec<AckHandle>,
    closed: bool,
}

fn fold_pane<I, K, A>(
    key: &K,
    pane: &Pane<I>,
    init: &(dyn Fn() -> A + Send + Sync),
    fold: &(dyn Fn(A, I) -> A + Send + Sync),
) -> Envelope
where
    I: Clone + Send + Sync + 'static,
    K: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    let mut acc = init();
    for item in &pane.items {
        acc = fold(acc, item.clone());
    }
    let mut env = Envelope::new(WindowedAggregate {
        key: key.clone(),
        window: pane.window,
        value: acc,
    })
    .with_event_time(pane.window.end);
    env.acks = pane.acks.clone();
    env
}

/// Keyed windowed fold. Items are buffered per `(key, window)` pane and
/// folded when the pane closes, which is also what lets
/// [`LatePolicy::Update`] recompute a pane from its items.
pub struct AggregateState<I, K, A> {
    node_id: String,
    config: WindowConfig,
    key_fn: Arc<dyn Fn(&I) -> K + Send + Sync>,
    init: Arc<dyn Fn() -> A + Send + Sync>,
    fold: Arc<dyn Fn(A, I) -> A + Send + Sync>,
    panes: HashMap<K, Vec<Pane<I>>>,
    watermark: i64,
    late_drops: u64,
}

impl<I, K, A> AggregateState<I, K, A>
where
    I: Clone + Send + Sync + 'static,
    K: Clone + Eq + Hash + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    pub fn new(
        node_id: impl Into<String>,
        config: WindowConfig,
        key_fn: Arc<dyn Fn(&I) -> K + Send + Sync>,
        init: Arc<dyn Fn() -> A + Send + Sync>,
        fold: Arc<dyn Fn(A, I) -> A + Send + Sync>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            key_fn,
            init,
            fold,
            panes: HashMap::new(),
            watermark: i64::MIN,
            late_drops: 0,
        }
    }

    fn lateness_ms(&self) -> i64 {
        self.config.allowed_lateness.as_millis() as i64
    }

    /// Close every pane the current watermark has passed, emit its fold,
    /// and garbage-collect panes past allowed lateness.
    fn close_due(&mut self) -> Vec<Envelope> {
        let watermark = self.watermark;
        let lateness = self.lateness_ms();
        let init = self.init.clone();
        let fold = self.fold.clone();

        let mut emissions: Vec<(Window, Envelope)> = Vec::new();
        for (key, panes) in self.panes.iter_mut() {
            for pane in panes.iter_mut() {
                if !pane.closed && watermark >= pane.window.end {
                    pane.closed = true;
                    emissions.push((pane.window, fold_pane(key, &*pane, &*init, &*fold)));
                }
            }
        }
        emissions.sort_by_key(|(w, _)| *w);

        for panes in self.panes.values_mut() {
            panes.retain(|p| !(p.closed && watermark.saturating_sub(lateness) >= p.window.end));
        }
        self.panes.retain(|_, panes| !panes.is_empty());

        emissions.into_iter().map(|(_, e)| e).collect()
    }
}

impl<I, K, A> WindowedState for AggregateState<I, K, A>
where
    I: Clone + Send + Sync + 'static,
    K: Clone + Eq + Hash + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    fn on_item(&mut self, _input: usize, env: Envelope, proc_now_ms: i64) -> Result<StateOutput, EngineError> {
        let mut out = StateOutput::default();
        let ts = match self.config.time_mode {
            TimeMode::Processing => proc_now_ms,
            TimeMode::EventTime => env.event_time.ok_or_else(|| EngineError::Configuration {
                message: format!(
                    "node `{}` uses event-time windows but received an untimestamped item",
                    self.node_id
                ),
            })?,
        };

        let (item, meta) = env.take::<I>()?;
        let key = (self.key_fn)(&item);
        let lateness = self.lateness_ms();
        let watermark = self.watermark;
        let late_policy = self.config.late_policy;
        let init = self.init.clone();
        let fold = self.fold.clone();

        if self.config.assigner.is_session() {
            let seed = self.config.assigner.assign(ts).remove(0);
            if watermark >= seed.end + lateness {
                self.late_drops += 1;
                out.acks_to_resolve.extend(meta.acks);
                return Ok(out);
            }
            let panes = self.panes.entry(key.clone()).or_default();
            let mut merged = Pane {
                window: seed,
                items: vec![item],
                acks: meta.acks,
                closed: false,
            };
            let mut refire = false;
            let mut absorbed = Vec::new();
            panes.retain_mut(|p| {
                let mergeable = p.window.intersects(&merged.window)
                    && (!p.closed || late_policy == LatePolicy::Update);
                if mergeable {
                    refire |= p.closed;
                    absorbed.push(Pane {
                        window: p.window,
                        items: std::mem::take(&mut p.items),
                        acks: std::mem::take(&mut p.acks),
                        closed: false,
                    });
                    false
                } else {
                    true
                }
            });
            for p in absorbed {
                merged.window = merged.window.merge(&p.window);
                merged.items.extend(p.items);
                merged.acks.extend(p.acks);
            }
            if refire {
                out.emit.push(fold_pane(&key, &merged, &*init, &*fold));
                merged.closed = true;
            }
            panes.push(merged);
            return Ok(out);
        }

        for window in self.config.assigner.assign(ts) {
            if watermark >= window.end + lateness {
                self.late_drops += 1;
                out.acks_to_resolve.extend(meta.acks.iter().cloned());
                continue;
            }
            let panes = self.panes.entry(key.clone()).or_default();
            let pane = match panes.iter_mut().position(|p| p.window == window) {
                Some(i) => &mut panes[i],
                None => {
                    panes.push(Pane {
                        window,
                        items: Vec::new(),
                        acks: Vec::new(),
                        closed: false,
                    });
                    panes.last_mut().expect("just pushed")
                }
            };
            if pane.closed {
                // within allowed lateness, after the pane already fired
                match late_policy {
                    LatePolicy::Drop => {
                        self.late_drops += 1;
                        out.acks_to_resolve.extend(meta.acks.iter().cloned());
                    }
                    LatePolicy::SideOutput => {
                        let mut side = Envelope::new(item.clone());
                        side.event_time = Some(ts);
                        side.acks = meta.acks.clone();
                        side.source_meta = meta.source_meta.clone();
                        out.side.push(side);
                    }
                    LatePolicy::Update => {
                        pane.items.push(item.clone());
                        pane.acks.extend(meta.acks.iter().cloned());
                        out.emit.push(fold_pane(&key, &*pane, &*init, &*fold));
                    }
                }
            } else {
                pane.items.push(item.clone());
                pane.acks.extend(meta.acks.iter().cloned());
            }
        }
        Ok(out)
    }

    fn on_watermark(&mut self, _input: usize, watermark: i64) -> StateOutput {
        let mut out = StateOutput::default();
        if watermark <= self.watermark {
            return out;
        }
        self.watermark = watermark;
        out.emit = self.close_due();
        out.forward_watermark = Some(watermark);
        out
    }

    fn on_eos(&mut self, _input: usize) -> StateOutput {
        let mut out = StateOutput::default();
        self.watermark = i64::MAX;
        out.emit = self.close_due();
        out
    }

    fn late_drops(&self) -> u64 {
        self.late_drops
    }
}

/// Join flavor; inner by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl Default for JoinType {
    fn default() -> Self {
        JoinType::Inner
    }
}

struct JoinPane<L, R> {
    window: Window,
    left: Vec<L>,
    right: Vec<R>,
    acks: Vec<AckHandle>,
    closed: bool,
}

fn emit_join_pane<L, R, O>(
    pane: &JoinPane<L, R>,
    join_type: JoinType,
    combine: &(dyn Fn(Option<&L>, Option<&R>) -> O + Send + Sync),
) -> Vec<Envelope>
where
    L: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    let mut results: Vec<O> = Vec::new();
    if !pane.left.is_empty() && !pane.right.is_empty() {
        for l in &pane.left {
            for r in &pane.right {
                results.push(combine(Some(l), Some(r)));
            }
        }
    } else if pane.right.is_empty() && matches!(join_type, JoinType::LeftOuter | JoinType::FullOuter) {
        for l in &pane.left {
            results.push(combine(Some(l), None));
        }
    } else if pane.left.is_empty() && matches!(join_type, JoinType::RightOuter | JoinType::FullOuter) {
        for r in &pane.right {
            results.push(combine(None, Some(r)));
        }
    }
    results
        .into_iter()
        .map(|o| {
            let mut env = Envelope::new(o).with_event_time(pane.window.end);
            env.acks = pane.acks.clone();
            env
        })
        .collect()
}

/// Two-input keyed windowed join over a shared assigner. A pane closes when
/// the minimum of the two input watermarks passes its end (an input that
/// reached end of stream counts as +inf), producing the per-key cross
/// product plus the unmatched rows the join type asks for.
pub struct JoinState<L, R, K, O> {
    node_id: String,
    config: WindowConfig,
    join_type: JoinType,
    key_left: Arc<dyn Fn(&L) -> K + Send + Sync>,
    key_right: Arc<dyn Fn(&R) -> K + Send + Sync>,
    combine: Arc<dyn Fn(Option<&L>, Option<&R>) -> O + Send + Sync>,
    panes: HashMap<K, Vec<JoinPane<L, R>>>,
    watermarks: [i64; 2],
    eos: [bool; 2],
    forwarded: i64,
    late_drops: u64,
}

impl<L, R, K, O> JoinState<L, R, K, O>
where
    L: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    K: Clone + Eq + Hash + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new(
        node_id: impl Into<String>,
        config: WindowConfig,
        join_type: JoinType,
        key_left: Arc<dyn Fn(&L) -> K + Send + Sync>,
        key_right: Arc<dyn Fn(&R) -> K + Send + Sync>,
        combine: Arc<dyn Fn(Option<&L>, Option<&R>) -> O + Send + Sync>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            join_type,
            key_left,
            key_right,
            combine,
            panes: HashMap::new(),
            watermarks: [i64::MIN; 2],
            eos: [false; 2],
            forwarded: i64::MIN,
            late_drops: 0,
        }
    }

    fn combined_watermark(&self) -> i64 {
        let w0 = if self.eos[0] { i64::MAX } else { self.watermarks[0] };
        let w1 = if self.eos[1] { i64::MAX } else { self.watermarks[1] };
        w0.min(w1)
    }

    fn close_due(&mut self, out: &mut StateOutput) {
        let combined = self.combined_watermark();
        let lateness = self.config.allowed_lateness.as_millis() as i64;
        let join_type = self.join_type;
        let combine = self.combine.clone();

        let mut emissions: Vec<(Window, Vec<Envelope>)> = Vec::new();
        for panes in self.panes.values_mut() {
            for pane in panes.iter_mut() {
                if !pane.closed && combined >= pane.window.end {
                    pane.closed = true;
                    let envs = emit_join_pane(&*pane, join_type, &*combine);
                    if envs.is_empty() {
                        out.acks_to_resolve.extend(pane.acks.iter().cloned());
                    }
                    emissions.push((pane.window, envs));
                }
            }
        }
        emissions.sort_by_key(|(w, _)| *w);
        for (_, envs) in emissions {
            out.emit.extend(envs);
        }

        for panes in self.panes.values_mut() {
            panes.retain(|p| !(p.closed && combined.saturating_sub(lateness) >= p.window.end));
        }
        self.panes.retain(|_, panes| !panes.is_empty());
    }
}

impl<L, R, K, O> WindowedState for JoinState<L, R, K, O>
where
    L: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    K: Clone + Eq + Hash + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn on_item(&mut self, input: usize, env: Envelope, proc_now_ms: i64) -> Result<StateOutput, EngineError> {
        let mut out = StateOutput::default();
        let ts = match self.config.time_mode {
            TimeMode::Processing => proc_now_ms,
            TimeMode::EventTime => env.event_time.ok_or_else(|| EngineError::Configuration {
                message: format!(
                    "node `{}` uses event-time windows but received an untimestamped item",
                    self.node_id
                ),
            })?,
        };

        enum Side<L, R> {
            Left(L),
            Right(R),
        }
        let (key, side, acks) = if input == 0 {
            let (item, meta) = env.take::<L>()?;
            ((self.key_left)(&item), Side::Left(item), meta.acks)
        } else {
            let (item, meta) = env.take::<R>()?;
            ((self.key_right)(&item), Side::Right(item), meta.acks)
        };

        let combined = self.combined_watermark();
        let lateness = self.config.allowed_lateness.as_millis() as i64;
        let is_session = self.config.assigner.is_session();
        let late_policy = self.config.late_policy;
        let join_type = self.join_type;
        let combine = self.combine.clone();

        for window in self.config.assigner.assign(ts) {
            if combined >= window.end + lateness {
                self.late_drops += 1;
                out.acks_to_resolve.extend(acks.iter().cloned());
                continue;
            }
            let panes = self.panes.entry(key.clone()).or_default();
            let position = if is_session {
                panes.iter().position(|p| p.window.intersects(&window))
            } else {
                panes.iter().position(|p| p.window == window)
            };
            let pane = match position {
                Some(i) => {
                    if is_session {
                        panes[i].window = panes[i].window.merge(&window);
                    }
                    &mut panes[i]
                }
                None => {
                    panes.push(JoinPane {
                        window,
                        left: Vec::new(),
                        right: Vec::new(),
                        acks: Vec::new(),
                        closed: false,
                    });
                    panes.last_mut().expect("just pushed")
                }
            };
            if pane.closed {
                match late_policy {
                    LatePolicy::Drop => {
                        self.late_drops += 1;
                        out.acks_to_resolve.extend(acks.iter().cloned());
                    }
                    LatePolicy::SideOutput => {
                        let mut side_env = match &side {
                            Side::Left(l) => Envelope::new(l.clone()),
                            Side::Right(r) => Envelope::new(r.clone()),
                        };
                        side_env.event_time = Some(ts);
                        side_env.acks = acks.clone();
                        out.side.push(side_env);
                    }
                    LatePolicy::Update => {
                        match &side {
                            Side::Left(l) => pane.left.push(l.clone()),
                            Side::Right(r) => pane.right.push(r.clone()),
                        }
                        pane.acks.extend(acks.iter().cloned());
                        out.emit.extend(emit_join_pane(&*pane, join_type, &*combine));
                    }
                }
            } else {
                match &side {
                    Side::Left(l) => pane.left.push(l.clone()),
                    Side::Right(r) => pane.right.push(r.clone()),
                }
                pane.acks.extend(acks.iter().cloned());
            }
        }
        Ok(out)
    }

    fn on_watermark(&mut self, input: usize, watermark: i64) -> StateOutput {
        let mut out = StateOutput::default();
        if input < 2 && watermark > self.watermarks[input] {
            self.watermarks[input] = watermark;
        }
        let combined = self.combined_watermark();
        if combined > self.forwarded {
            self.close_due(&mut out);
            if combined < i64::MAX {
                out.forward_watermark = Some(combined);
                self.forwarded = combined;
            }
        }
        out
    }

    fn on_eos(&mut self, input: usize) -> StateOutput {
        let mut out = StateOutput::default();
        if input < 2 {
            self.eos[input] = true;
        }
        self.close_due(&mut out);
        out
    }

    fn late_drops(&self) -> u64 {
        self.late_drops
    }
}
