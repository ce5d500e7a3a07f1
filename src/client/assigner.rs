//! Per-worker sample dispenser with peer-to-peer work stealing.
//!
//! Every worker has one fixed helpee peer. Once per pass, at the checkpoint
//! fraction of its effective range, a worker reports its progress to the
//! helpee. A helpee that finds itself behind hands a tail slice of its own
//! range to the reporter (`DoThis`), which serves those indices out of its
//! local copy of the helpee's data. All assigner state lives on a dedicated
//! actor thread; the worker thread and the helper thread only post events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::mailbox::{Flag, Message, ThreadId};
use crate::utils::{ParasyncError, ThreadsafeQueue};

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, oneshot};

/// Number of recent pass-time estimates averaged into `avg_iter_time`.
const ITER_TIME_HISTORY: usize = 8;

/// Contiguous slice `[start, end)` of sample indices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub struct DataRange {
    pub start: usize,
    pub end: usize,
}

impl DataRange {
    pub fn new(start: usize, end: usize) -> Self {
        DataRange {
            start,
            end: end.max(start),
        }
    }

    pub fn length(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.start <= idx && idx < self.end
    }

    /// Splits into `k` consecutive slices of `ceil(length / k)` indices, the
    /// trailing ones clipped at `end` (possibly empty).
    pub fn split(&self, k: usize) -> Vec<DataRange> {
        if k == 0 {
            return vec![];
        }
        let step = (self.length() + k - 1) / k;
        (0..k)
            .map(|i| {
                let start = (self.start + i * step).min(self.end);
                DataRange::new(start, (start + step).min(self.end))
            })
            .collect()
    }
}

/// Tunables of the stealing protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignerConfig {
    /// Fraction of the effective range after which progress is reported.
    pub checkpoint: f64,

    /// Minimum remaining fraction of own range worth handing out.
    pub min_reassign_ratio: f64,

    /// Progress lead of a reporter above which help is offered.
    pub help_threshold: f64,

    /// Upper bound on samples per pass-time measurement window.
    pub window_size: usize,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        AssignerConfig {
            checkpoint: 0.75,
            min_reassign_ratio: 0.05,
            help_threshold: 0.2,
            window_size: 100,
        }
    }
}

/// State of the help I asked a peer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelpRequestStatus {
    None,
    /// `DoThis` sent, peer has not begun.
    Requested,
    /// Peer began serving my tail.
    Accepted,
    /// Peer finished my tail.
    Completed,
}

/// State of the help I give my helpee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelpingStatus {
    NotReported,
    NoHelpNeeded,
    /// Reported progress, waiting for the helpee's answer.
    AwaitingPeer,
    /// Holding borrowed work not yet started.
    AcceptedPending,
    ActivelyHelping,
}

/// Snapshot of an assigner's state.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignerStatus {
    pub iter_num: u64,
    pub cur_sample: usize,
    pub stop_idx: usize,
    pub help_request: HelpRequestStatus,
    pub helping: HelpingStatus,
    /// Estimated wall time of one pass in milliseconds.
    pub avg_iter_time: f64,
    /// Borrowed indices not yet handed out.
    pub borrowed_left: usize,
}

/// Events processed by the actor thread.
pub(crate) enum AssignerEvent {
    NextSample(oneshot::Sender<Option<usize>>),
    Peer(Message),
    Query(oneshot::Sender<AssignerStatus>),
    Retire(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to a worker's assigner actor.
pub struct WorkAssigner {
    me: ThreadId,
    range: DataRange,
    helpee: Option<ThreadId>,
    tx_event: mpsc::UnboundedSender<AssignerEvent>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkAssigner {
    /// Spawns the actor for worker `me` owning `range`. `helpee_range` is
    /// where the helpee's data sits in my local store; borrowed offsets are
    /// mapped onto it.
    pub fn new_and_setup(
        me: ThreadId,
        range: DataRange,
        helpee_range: DataRange,
        helpee: Option<ThreadId>,
        send_queue: Arc<ThreadsafeQueue<Message>>,
        config: AssignerConfig,
    ) -> Result<Self, ParasyncError> {
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let mut actor = AssignerActor::new(
            me,
            range,
            helpee_range,
            helpee,
            send_queue,
            config,
        );
        let handle = thread::Builder::new()
            .name(format!("assigner-{}", me))
            .spawn(move || actor.run(rx_event))?;

        Ok(WorkAssigner {
            me,
            range,
            helpee,
            tx_event,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn me(&self) -> ThreadId {
        self.me
    }

    /// The worker's originally assigned range.
    pub fn data_range(&self) -> DataRange {
        self.range
    }

    pub fn helpee(&self) -> Option<ThreadId> {
        self.helpee
    }

    fn send_event(&self, event: AssignerEvent) -> Result<(), ParasyncError> {
        self.tx_event.send(event).map_err(|_| {
            ParasyncError::msg(format!("assigner of {} is gone", self.me))
        })
    }

    /// Next sample index to process, or `None` at the end of a pass. May
    /// block while waiting on the peer.
    pub fn next_sample(&self) -> Result<Option<usize>, ParasyncError> {
        let (tx, rx) = oneshot::channel();
        self.send_event(AssignerEvent::NextSample(tx))?;
        Ok(rx.blocking_recv()?)
    }

    /// Posts a peer protocol message to the actor.
    pub fn post(&self, msg: Message) -> Result<(), ParasyncError> {
        self.send_event(AssignerEvent::Peer(msg))
    }

    pub fn status(&self) -> Result<AssignerStatus, ParasyncError> {
        let (tx, rx) = oneshot::channel();
        self.send_event(AssignerEvent::Query(tx))?;
        Ok(rx.blocking_recv()?)
    }

    /// Marks the worker as done sampling. The actor keeps answering peers
    /// until `shutdown`.
    pub fn retire(&self) -> Result<(), ParasyncError> {
        let (tx, rx) = oneshot::channel();
        self.send_event(AssignerEvent::Retire(tx))?;
        Ok(rx.blocking_recv()?)
    }

    /// Stops the actor thread and joins it.
    pub fn shutdown(&self) -> Result<(), ParasyncError> {
        let handle = self.handle.lock()?.take();
        if let Some(handle) = handle {
            // actor may already be gone
            let _ = self.tx_event.send(AssignerEvent::Shutdown);
            if handle.join().is_err() {
                return logged_err!("assigner of {} panicked", self.me);
            }
        }
        Ok(())
    }

    pub(crate) fn inbox(&self) -> mpsc::UnboundedSender<AssignerEvent> {
        self.tx_event.clone()
    }
}

impl Drop for WorkAssigner {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Index range lent to me by a helpee, already mapped to local indices.
#[derive(Debug, Clone, Copy)]
struct BorrowedWork {
    peer: ThreadId,
    ts: i64,
    next: usize,
    end: usize,
    begun: bool,
}

impl BorrowedWork {
    fn left(&self) -> usize {
        self.end - self.next
    }
}

/// My outstanding offer of own work.
#[derive(Debug, Clone, Copy)]
struct Offer {
    peer: ThreadId,
    ts: i64,
}

/// Outcome of one sampling step.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Sample(usize),
    EndOfPass,
    Wait,
}

struct AssignerActor {
    me: ThreadId,
    range: DataRange,
    helpee_range: DataRange,
    helpee: Option<ThreadId>,
    send_queue: Arc<ThreadsafeQueue<Message>>,
    config: AssignerConfig,

    cur_sample: usize,
    stop_idx: usize,
    iter_num: u64,
    reported: bool,

    window_size: usize,
    window_count: usize,
    window_start: Instant,
    iter_times: VecDeque<f64>,
    avg_iter_time: f64,

    help_request: HelpRequestStatus,
    helping: HelpingStatus,
    offer: Option<Offer>,

    high_queue: VecDeque<BorrowedWork>,
    low_queue: VecDeque<BorrowedWork>,
    serving: Option<BorrowedWork>,
    last_cancel: HashMap<ThreadId, i64>,

    last_ts: i64,
    retired: bool,
    parked: Option<oneshot::Sender<Option<usize>>>,
}

impl AssignerActor {
    fn new(
        me: ThreadId,
        range: DataRange,
        helpee_range: DataRange,
        helpee: Option<ThreadId>,
        send_queue: Arc<ThreadsafeQueue<Message>>,
        config: AssignerConfig,
    ) -> Self {
        let window_size = ((range.length() as f64 * config.checkpoint)
            .floor() as usize)
            .clamp(1, config.window_size.max(1));
        AssignerActor {
            me,
            range,
            helpee_range,
            helpee,
            send_queue,
            config,
            cur_sample: range.start,
            stop_idx: range.end,
            iter_num: 0,
            reported: false,
            window_size,
            window_count: 0,
            window_start: Instant::now(),
            iter_times: VecDeque::new(),
            avg_iter_time: 0.0,
            help_request: HelpRequestStatus::None,
            helping: HelpingStatus::NotReported,
            offer: None,
            high_queue: VecDeque::new(),
            low_queue: VecDeque::new(),
            serving: None,
            last_cancel: HashMap::new(),
            last_ts: 0,
            retired: false,
            parked: None,
        }
    }

    /// Actor thread function.
    fn run(&mut self, mut rx_event: mpsc::UnboundedReceiver<AssignerEvent>) {
        pf_debug!("assigner {} spawned over {:?}", self.me, self.range);

        while let Some(event) = rx_event.blocking_recv() {
            match event {
                AssignerEvent::NextSample(tx) => {
                    if self.parked.is_some() {
                        pf_warn!("assigner {} got concurrent request", self.me);
                    }
                    self.parked = Some(tx);
                }
                AssignerEvent::Peer(msg) => self.handle_peer_msg(msg),
                AssignerEvent::Query(tx) => {
                    let _ = tx.send(self.status());
                }
                AssignerEvent::Retire(tx) => {
                    self.retire();
                    let _ = tx.send(());
                }
                AssignerEvent::Shutdown => break,
            }
            self.serve_parked();
        }

        pf_debug!("assigner {} exited", self.me);
    }

    /// Answers the parked sample request unless it still has to wait.
    fn serve_parked(&mut self) {
        if self.parked.is_none() {
            return;
        }
        let reply = match self.step() {
            Step::Wait => return,
            Step::Sample(idx) => Some(idx),
            Step::EndOfPass => None,
        };
        if let Some(tx) = self.parked.take() {
            let _ = tx.send(reply);
        }
    }

    fn status(&self) -> AssignerStatus {
        AssignerStatus {
            iter_num: self.iter_num,
            cur_sample: self.cur_sample,
            stop_idx: self.stop_idx,
            help_request: self.help_request,
            helping: self.helping,
            avg_iter_time: self.avg_iter_time,
            borrowed_left: self
                .serving
                .iter()
                .chain(self.high_queue.iter())
                .chain(self.low_queue.iter())
                .map(|w| w.left())
                .sum(),
        }
    }

    /// Strictly increasing wall-clock timestamp in milliseconds.
    fn next_ts(&mut self) -> i64 {
        let ts = now_ms().max(self.last_ts + 1);
        self.last_ts = ts;
        ts
    }

    fn send_peer(&self, peer: ThreadId, flag: Flag, payload: &[i64]) {
        self.send_queue
            .push(Message::new(self.me, peer, 0, flag).with_data(payload));
    }

    /// Fraction of my original range already processed this pass.
    fn my_fraction(&self) -> f64 {
        if self.range.is_empty() {
            1.0
        } else {
            (self.cur_sample - self.range.start) as f64
                / self.range.length() as f64
        }
    }

    /// Fraction of my original range still ahead of me this pass.
    fn remaining_fraction(&self) -> f64 {
        if self.range.is_empty() {
            0.0
        } else {
            (self.stop_idx - self.cur_sample) as f64
                / self.range.length() as f64
        }
    }

    fn checkpoint_reached(&self) -> bool {
        let effective = (self.stop_idx - self.range.start) as f64;
        let mark = (effective * self.config.checkpoint).ceil() as usize;
        self.cur_sample - self.range.start >= mark
    }

    /// Counts one own sample into the pass-time window.
    fn tick_window(&mut self) {
        self.window_count += 1;
        if self.window_count < self.window_size {
            return;
        }
        let elapsed = self.window_start.elapsed().as_secs_f64() * 1000.0;
        let estimate =
            elapsed * self.range.length() as f64 / self.window_count as f64;
        self.iter_times.push_back(estimate);
        if self.iter_times.len() > ITER_TIME_HISTORY {
            self.iter_times.pop_front();
        }
        self.avg_iter_time =
            statistical::mean(self.iter_times.make_contiguous());
        self.window_count = 0;
        self.window_start = Instant::now();
    }

    fn restart_pass(&mut self) {
        self.iter_num += 1;
        self.cur_sample = self.range.start;
        self.stop_idx = self.range.end;
        self.reported = false;
        self.help_request = HelpRequestStatus::None;
        self.offer = None;
        self.window_count = 0;
        self.window_start = Instant::now();
        pf_trace!("assigner {} starting pass {}", self.me, self.iter_num);
    }

    fn no_borrowed_work(&self) -> bool {
        self.serving.is_none()
            && self.high_queue.is_empty()
            && self.low_queue.is_empty()
    }

    /// Computes the next sampling step.
    fn step(&mut self) -> Step {
        if self.retired {
            return Step::EndOfPass;
        }
        if self.helping == HelpingStatus::AwaitingPeer {
            return Step::Wait;
        }

        // report progress once per pass at the checkpoint
        if let Some(helpee) = self.helpee {
            if !self.reported && self.checkpoint_reached() {
                self.reported = true;
                let bp = (self.my_fraction() * 10000.0).round() as i64;
                let ts = self.next_ts();
                self.send_peer(
                    helpee,
                    Flag::ProgressReport,
                    &[self.iter_num as i64, bp, ts],
                );
                if self.help_request == HelpRequestStatus::None {
                    self.helping = HelpingStatus::AwaitingPeer;
                    return Step::Wait;
                }
            }
        }

        // borrowed work: high priority first, low priority only at my stop
        loop {
            if let Some(work) = self.serving.as_mut() {
                if work.next < work.end {
                    let idx = work.next;
                    work.next += 1;
                    return Step::Sample(idx);
                }
                let done = *work;
                self.serving = None;
                self.send_peer(done.peer, Flag::HelpCompleted, &[done.ts]);
                pf_debug!(
                    "assigner {} finished help for {}",
                    self.me,
                    done.peer
                );
                continue;
            }
            if let Some(work) = self.high_queue.pop_front() {
                self.serving = Some(work);
                self.helping = HelpingStatus::ActivelyHelping;
                continue;
            }
            if self.cur_sample >= self.stop_idx {
                if let Some(mut work) = self.low_queue.pop_front() {
                    work.begun = true;
                    self.send_peer(work.peer, Flag::BegunHelping, &[work.ts]);
                    self.serving = Some(work);
                    self.helping = HelpingStatus::ActivelyHelping;
                    continue;
                }
            }
            break;
        }
        if self.no_borrowed_work()
            && matches!(
                self.helping,
                HelpingStatus::ActivelyHelping | HelpingStatus::AcceptedPending
            )
        {
            self.helping = HelpingStatus::NoHelpNeeded;
        }

        // own samples
        if self.cur_sample < self.stop_idx {
            let idx = self.cur_sample;
            self.cur_sample += 1;
            self.tick_window();
            return Step::Sample(idx);
        }

        // at my stop index
        match self.help_request {
            HelpRequestStatus::Requested => {
                // peer never began; take the tail back
                let ts = self.next_ts();
                if let Some(offer) = self.offer.take() {
                    self.send_peer(
                        offer.peer,
                        Flag::CancelHelp,
                        &[self.iter_num as i64, ts],
                    );
                }
                pf_debug!(
                    "assigner {} reclaiming {}..{}",
                    self.me,
                    self.stop_idx,
                    self.range.end
                );
                self.help_request = HelpRequestStatus::None;
                self.stop_idx = self.range.end;
                self.step()
            }
            HelpRequestStatus::Accepted => Step::Wait,
            HelpRequestStatus::None | HelpRequestStatus::Completed => {
                self.restart_pass();
                Step::EndOfPass
            }
        }
    }

    fn handle_peer_msg(&mut self, msg: Message) {
        let peer = msg.meta.sender;
        let payload = match msg.get_data::<i64>(0) {
            Ok(payload) => payload,
            Err(e) => {
                pf_warn!("bad {:?} from {}: {}", msg.meta.flag, peer, e);
                return;
            }
        };
        pf_trace!(
            "assigner {} got {:?} {:?} from {}",
            self.me,
            msg.meta.flag,
            payload,
            peer
        );

        match (msg.meta.flag, payload.as_slice()) {
            (Flag::ProgressReport, &[iter, bp, ts]) => {
                self.on_progress_report(peer, iter, bp, ts)
            }
            (Flag::DoThis, &[iter, start_off, end_off, ts]) => {
                self.on_do_this(peer, iter, start_off, end_off, ts)
            }
            (Flag::BegunHelping, &[ts]) => {
                if self.matches_offer(peer, ts)
                    && self.help_request == HelpRequestStatus::Requested
                {
                    self.help_request = HelpRequestStatus::Accepted;
                }
            }
            (Flag::HelpCompleted, &[ts]) => {
                if self.matches_offer(peer, ts) {
                    self.help_request = HelpRequestStatus::Completed;
                }
            }
            (Flag::CancelHelp, &[_iter, ts]) => self.on_cancel_help(peer, ts),
            (Flag::DontNeedHelp, _) => {
                if self.helping == HelpingStatus::AwaitingPeer {
                    self.helping = HelpingStatus::NoHelpNeeded;
                }
            }
            (flag, _) => {
                pf_warn!("malformed {:?} from {}", flag, peer);
            }
        }
    }

    fn matches_offer(&self, peer: ThreadId, ts: i64) -> bool {
        match self.offer {
            Some(offer) if offer.peer == peer && offer.ts == ts => true,
            _ => {
                pf_debug!("assigner {} ignoring stale ack ts {}", self.me, ts);
                false
            }
        }
    }

    /// A reporter is ahead of me; possibly hand it my tail.
    fn on_progress_report(
        &mut self,
        peer: ThreadId,
        their_iter: i64,
        their_bp: i64,
        their_ts: i64,
    ) {
        let my_iter = self.iter_num as i64;
        if self.retired
            || their_iter < my_iter
            || self.help_request != HelpRequestStatus::None
        {
            self.send_peer(peer, Flag::DontNeedHelp, &[]);
            return;
        }

        let elapsed = (now_ms() - their_ts).max(0) as f64;
        let time_term = if self.avg_iter_time > 0.0 {
            (elapsed / self.avg_iter_time).min(1.0 - self.config.checkpoint)
        } else {
            0.0
        };
        let diff = (their_iter - my_iter) as f64
            + (their_bp as f64 / 10000.0 - self.my_fraction())
            + time_term;
        let remaining = self.remaining_fraction();

        if diff > self.config.help_threshold
            && remaining > self.config.min_reassign_ratio
        {
            let ratio = (diff / 2.0).min(remaining / 2.0);
            let n = ((ratio * self.range.length() as f64).floor() as usize)
                .clamp(1, self.stop_idx - self.cur_sample);
            let start_off = (self.stop_idx - n - self.range.start) as i64;
            let end_off = (self.stop_idx - self.range.start) as i64;
            self.stop_idx -= n;
            let ts = self.next_ts();
            self.offer = Some(Offer { peer, ts });
            self.help_request = HelpRequestStatus::Requested;
            self.send_peer(
                peer,
                Flag::DoThis,
                &[my_iter, start_off, end_off, ts],
            );
            pf_debug!(
                "assigner {} offered {} samples to {} (diff {:.3})",
                self.me,
                n,
                peer,
                diff
            );
        } else {
            self.send_peer(peer, Flag::DontNeedHelp, &[]);
        }
    }

    /// My helpee asks me to serve a slice of its range.
    fn on_do_this(
        &mut self,
        peer: ThreadId,
        their_iter: i64,
        start_off: i64,
        end_off: i64,
        ts: i64,
    ) {
        if self.helping == HelpingStatus::AwaitingPeer {
            self.helping = HelpingStatus::NoHelpNeeded;
        }
        if self.retired {
            pf_debug!("assigner {} retired, ignoring offer", self.me);
            return;
        }
        if self.last_cancel.get(&peer).is_some_and(|&c| ts <= c) {
            pf_debug!("assigner {} ignoring canceled offer ts {}", self.me, ts);
            return;
        }

        let base = self.helpee_range.start;
        let limit = self.helpee_range.end;
        let start = (base + start_off.max(0) as usize).min(limit);
        let end = (base + end_off.max(0) as usize).min(limit);
        if start >= end {
            pf_debug!("assigner {} got empty offer from {}", self.me, peer);
            return;
        }

        let mut work = BorrowedWork {
            peer,
            ts,
            next: start,
            end,
            begun: false,
        };
        if their_iter < self.iter_num as i64 {
            work.begun = true;
            self.send_peer(peer, Flag::BegunHelping, &[ts]);
            self.high_queue.push_back(work);
        } else {
            self.low_queue.push_back(work);
        }
        if self.helping != HelpingStatus::ActivelyHelping {
            self.helping = HelpingStatus::AcceptedPending;
        }
    }

    /// The helpee took back work; drop everything older from it.
    fn on_cancel_help(&mut self, peer: ThreadId, ts: i64) {
        let last = self.last_cancel.entry(peer).or_insert(ts);
        *last = (*last).max(ts);

        let stale = |w: &BorrowedWork| w.peer == peer && w.ts < ts;
        self.high_queue.retain(|w| !stale(w));
        self.low_queue.retain(|w| !stale(w));
        if self.serving.as_ref().is_some_and(stale) {
            pf_debug!("assigner {} stopped serving {}", self.me, peer);
            self.serving = None;
        }
        if self.no_borrowed_work()
            && self.helping != HelpingStatus::AwaitingPeer
            && self.helping != HelpingStatus::NotReported
        {
            self.helping = HelpingStatus::NoHelpNeeded;
        }
    }

    /// Worker is done: release accepted work, drop the rest.
    fn retire(&mut self) {
        self.retired = true;
        let accepted: Vec<BorrowedWork> = self
            .serving
            .take()
            .into_iter()
            .chain(self.high_queue.drain(..))
            .chain(self.low_queue.drain(..).filter(|w| w.begun))
            .collect();
        self.low_queue.clear();
        for work in accepted {
            pf_warn!(
                "assigner {} retiring with {} borrowed samples of {} left",
                self.me,
                work.left(),
                work.peer
            );
            self.send_peer(work.peer, Flag::HelpCompleted, &[work.ts]);
        }
        self.helping = HelpingStatus::NoHelpNeeded;
        pf_debug!(
            "assigner {} retired after {} passes",
            self.me,
            self.iter_num
        );
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod assigner_tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn split_ranges() {
        let r = DataRange::new(0, 10);
        assert_eq!(
            r.split(3),
            vec![
                DataRange::new(0, 4),
                DataRange::new(4, 8),
                DataRange::new(8, 10)
            ]
        );
        assert_eq!(
            DataRange::new(5, 7).split(4),
            vec![
                DataRange::new(5, 6),
                DataRange::new(6, 7),
                DataRange::new(7, 7),
                DataRange::new(7, 7)
            ]
        );
        assert!(r.split(0).is_empty());
        assert_eq!(DataRange::new(3, 1).length(), 0);
        assert!(r.contains(9) && !r.contains(10));
    }

    fn lone_assigner(
        range: DataRange,
    ) -> Result<(WorkAssigner, Arc<ThreadsafeQueue<Message>>), ParasyncError>
    {
        let send_queue = Arc::new(ThreadsafeQueue::new());
        let assigner = WorkAssigner::new_and_setup(
            ThreadId::worker(0, 0),
            range,
            DataRange::default(),
            None,
            send_queue.clone(),
            AssignerConfig::default(),
        )?;
        Ok((assigner, send_queue))
    }

    #[test]
    fn passes_without_peer() -> Result<(), ParasyncError> {
        let (assigner, send_queue) = lone_assigner(DataRange::new(10, 14))?;
        for _ in 0..3 {
            let mut got = vec![];
            while let Some(idx) = assigner.next_sample()? {
                got.push(idx);
            }
            assert_eq!(got, vec![10, 11, 12, 13]);
        }
        assert_eq!(assigner.status()?.iter_num, 3);
        assert!(send_queue.is_empty()?);
        assigner.retire()?;
        assert_eq!(assigner.next_sample()?, None);
        assigner.shutdown()?;
        assert!(assigner.next_sample().is_err());
        Ok(())
    }

    #[test]
    fn empty_range_ends_pass_immediately() -> Result<(), ParasyncError> {
        let (assigner, _) = lone_assigner(DataRange::new(5, 5))?;
        assert_eq!(assigner.next_sample()?, None);
        assert_eq!(assigner.next_sample()?, None);
        assert_eq!(assigner.status()?.iter_num, 2);
        Ok(())
    }

    fn peer_msg(
        from: ThreadId,
        to: ThreadId,
        flag: Flag,
        p: &[i64],
    ) -> Message {
        Message::new(from, to, 0, flag).with_data(p)
    }

    #[test]
    fn offer_on_report_then_reclaim() -> Result<(), ParasyncError> {
        let me = ThreadId::worker(0, 0);
        let reporter = ThreadId::worker(0, 1);
        let (assigner, send_queue) = lone_assigner(DataRange::new(0, 100))?;
        for _ in 0..10 {
            assigner.next_sample()?;
        }

        // reporter already done with its pass
        assigner.post(peer_msg(
            reporter,
            me,
            Flag::ProgressReport,
            &[0, 10000, now_ms()],
        ))?;
        let offer = send_queue.wait_and_pop()?;
        assert_eq!(offer.meta.flag, Flag::DoThis);
        assert_eq!(offer.meta.recver, reporter);
        let p = offer.get_data::<i64>(0)?;
        // ratio = min(0.9 / 2, 0.9 / 2) of 100
        assert_eq!(&p[..3], &[0, 55, 100]);
        let status = assigner.status()?;
        assert_eq!(status.stop_idx, 55);
        assert_eq!(status.help_request, HelpRequestStatus::Requested);

        // a second report while the offer is out gets turned down
        assigner.post(peer_msg(
            reporter,
            me,
            Flag::ProgressReport,
            &[0, 10000, now_ms()],
        ))?;
        assert_eq!(send_queue.wait_and_pop()?.meta.flag, Flag::DontNeedHelp);

        // nobody began: at stop the tail is reclaimed
        let mut got = vec![];
        while let Some(idx) = assigner.next_sample()? {
            got.push(idx);
        }
        assert_eq!(got, (10..100).collect::<Vec<usize>>());
        let cancel = send_queue.wait_and_pop()?;
        assert_eq!(cancel.meta.flag, Flag::CancelHelp);
        assert!(cancel.get_data::<i64>(0)?[1] > p[3]);
        assert_eq!(assigner.status()?.iter_num, 1);
        Ok(())
    }

    #[test]
    fn behind_reporter_turned_down() -> Result<(), ParasyncError> {
        let me = ThreadId::worker(0, 0);
        let (assigner, send_queue) = lone_assigner(DataRange::new(0, 4))?;
        while assigner.next_sample()?.is_some() {}
        assigner.post(peer_msg(
            ThreadId::worker(1, 0),
            me,
            Flag::ProgressReport,
            &[0, 10000, now_ms()],
        ))?;
        assert_eq!(send_queue.wait_and_pop()?.meta.flag, Flag::DontNeedHelp);
        Ok(())
    }

    #[test]
    fn canceled_offer_ignored() -> Result<(), ParasyncError> {
        let me = ThreadId::worker(0, 1);
        let helpee = ThreadId::worker(0, 0);
        let send_queue = Arc::new(ThreadsafeQueue::new());
        let assigner = WorkAssigner::new_and_setup(
            me,
            DataRange::new(0, 0),
            DataRange::new(100, 200),
            Some(helpee),
            send_queue.clone(),
            AssignerConfig::default(),
        )?;
        assigner.post(peer_msg(helpee, me, Flag::CancelHelp, &[0, 50]))?;
        assigner.post(peer_msg(helpee, me, Flag::DoThis, &[0, 90, 100, 40]))?;
        assert_eq!(assigner.status()?.borrowed_left, 0);
        assigner.post(peer_msg(helpee, me, Flag::DoThis, &[0, 90, 100, 60]))?;
        assert_eq!(assigner.status()?.borrowed_left, 10);

        // empty own range: report, then serve the borrowed slice
        let assigner = Arc::new(assigner);
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let assigner = assigner.clone();
            thread::spawn(move || {
                let mut got = vec![];
                while let Ok(Some(idx)) = assigner.next_sample() {
                    got.push(idx);
                }
                let _ = tx.send(got);
            })
        };
        let report = send_queue.wait_and_pop()?;
        assert_eq!(report.meta.flag, Flag::ProgressReport);
        assert_eq!(report.meta.recver, helpee);
        assert_eq!(report.get_data::<i64>(0)?[1], 10000);
        assigner.post(peer_msg(helpee, me, Flag::DontNeedHelp, &[]))?;
        let begun = send_queue.wait_and_pop()?;
        assert_eq!(begun.meta.flag, Flag::BegunHelping);
        assert_eq!(begun.get_data::<i64>(0)?, vec![60]);
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, (190..200).collect::<Vec<usize>>());
        let completed = send_queue.wait_and_pop()?;
        assert_eq!(completed.meta.flag, Flag::HelpCompleted);
        worker.join().unwrap();
        Ok(())
    }

    /// Runs one pass on a separate thread, since reporting blocks until the
    /// helpee answers.
    fn spawn_pass(
        assigner: Arc<WorkAssigner>,
    ) -> std::sync::mpsc::Receiver<Vec<usize>> {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let mut got = vec![];
            while let Ok(Some(idx)) = assigner.next_sample() {
                got.push(idx);
            }
            let _ = tx.send(got);
        });
        rx
    }

    #[test]
    fn lagging_helpee_served_first() -> Result<(), ParasyncError> {
        let me = ThreadId::worker(0, 1);
        let helpee = ThreadId::worker(0, 0);
        let send_queue = Arc::new(ThreadsafeQueue::new());
        let assigner = Arc::new(WorkAssigner::new_and_setup(
            me,
            DataRange::new(0, 2),
            DataRange::new(100, 200),
            Some(helpee),
            send_queue.clone(),
            AssignerConfig::default(),
        )?);

        // first pass: nobody needs help
        let pass = spawn_pass(assigner.clone());
        let report = send_queue.wait_and_pop()?;
        assert_eq!(report.meta.flag, Flag::ProgressReport);
        assert_eq!(report.get_data::<i64>(0)?[0], 0);
        assigner.post(peer_msg(helpee, me, Flag::DontNeedHelp, &[]))?;
        let got = pass.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, vec![0, 1]);
        assert_eq!(assigner.status()?.iter_num, 1);

        // helpee still in pass 0: begun right away, before any sample
        assigner.post(peer_msg(helpee, me, Flag::DoThis, &[0, 10, 13, 5]))?;
        let begun = send_queue.wait_and_pop()?;
        assert_eq!(begun.meta.flag, Flag::BegunHelping);
        assert_eq!(begun.meta.recver, helpee);
        assert_eq!(begun.get_data::<i64>(0)?, vec![5]);
        assert_eq!(assigner.status()?.borrowed_left, 3);

        // borrowed slice goes ahead of my own samples
        let pass = spawn_pass(assigner.clone());
        let completed = send_queue.wait_and_pop()?;
        assert_eq!(completed.meta.flag, Flag::HelpCompleted);
        assert_eq!(completed.get_data::<i64>(0)?, vec![5]);
        let report = send_queue.wait_and_pop()?;
        assert_eq!(report.meta.flag, Flag::ProgressReport);
        assert_eq!(report.get_data::<i64>(0)?[0], 1);
        assigner.post(peer_msg(helpee, me, Flag::DontNeedHelp, &[]))?;
        let got = pass.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, vec![110, 111, 112, 0, 1]);
        assert_eq!(assigner.status()?.helping, HelpingStatus::NoHelpNeeded);
        assert!(send_queue.is_empty()?);

        assigner.shutdown()?;
        Ok(())
    }

    /// Forwards every queued message to the assigner it is addressed to.
    fn spawn_router(
        send_queue: Arc<ThreadsafeQueue<Message>>,
        inboxes: HashMap<ThreadId, mpsc::UnboundedSender<AssignerEvent>>,
        log: Arc<Mutex<Vec<(ThreadId, Flag)>>>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(msg) = send_queue.wait_and_pop() {
                if msg.meta.flag == Flag::Exit {
                    break;
                }
                log.lock().unwrap().push((msg.meta.sender, msg.meta.flag));
                if let Some(inbox) = inboxes.get(&msg.meta.recver) {
                    let _ = inbox.send(AssignerEvent::Peer(msg));
                }
            }
        })
    }

    #[test]
    fn idle_peer_takes_straggler_tail() -> Result<(), ParasyncError> {
        let a = ThreadId::worker(0, 0);
        let b = ThreadId::worker(0, 1);
        let send_queue = Arc::new(ThreadsafeQueue::new());
        let config = AssignerConfig {
            window_size: 10,
            ..Default::default()
        };
        let assigner_a = Arc::new(WorkAssigner::new_and_setup(
            a,
            DataRange::new(0, 100),
            DataRange::new(100, 100),
            Some(b),
            send_queue.clone(),
            config,
        )?);
        let assigner_b = Arc::new(WorkAssigner::new_and_setup(
            b,
            DataRange::new(100, 100),
            DataRange::new(0, 100),
            Some(a),
            send_queue.clone(),
            config,
        )?);
        let log = Arc::new(Mutex::new(vec![]));
        let router = spawn_router(
            send_queue.clone(),
            HashMap::from([(a, assigner_a.inbox()), (b, assigner_b.inbox())]),
            log.clone(),
        );

        // A is a straggler processing one pass
        let worker_a = {
            let assigner = assigner_a.clone();
            thread::spawn(move || -> Result<Vec<usize>, ParasyncError> {
                let mut got = vec![];
                while let Some(idx) = assigner.next_sample()? {
                    thread::sleep(Duration::from_millis(2));
                    got.push(idx);
                }
                Ok(got)
            })
        };
        // B is idle and keeps asking until it has helped through one pass
        let worker_b = {
            let assigner = assigner_b.clone();
            thread::spawn(move || -> Result<Vec<usize>, ParasyncError> {
                let mut got = vec![];
                loop {
                    match assigner.next_sample()? {
                        Some(idx) => got.push(idx),
                        None if !got.is_empty() => break,
                        None => thread::sleep(Duration::from_millis(1)),
                    }
                }
                assigner.retire()?;
                Ok(got)
            })
        };

        let got_b = worker_b.join().unwrap()?;
        let got_a = worker_a.join().unwrap()?;
        assigner_a.retire()?;

        assert!(!got_b.is_empty());
        let mut all: Vec<usize> = got_a.iter().chain(&got_b).copied().collect();
        all.sort();
        assert_eq!(all, (0..100).collect::<Vec<usize>>());
        assert_eq!(
            got_a.iter().chain(&got_b).collect::<HashSet<_>>().len(),
            100
        );
        assert_eq!(assigner_a.status()?.iter_num, 1);
        assert_eq!(assigner_a.status()?.help_request, HelpRequestStatus::None);

        let flags: Vec<(ThreadId, Flag)> = log.lock().unwrap().clone();
        assert!(flags.contains(&(a, Flag::DoThis)));
        assert!(flags.contains(&(b, Flag::BegunHelping)));
        assert!(flags.contains(&(b, Flag::HelpCompleted)));
        assert!(!flags.contains(&(a, Flag::CancelHelp)));

        assigner_a.shutdown()?;
        assigner_b.shutdown()?;
        send_queue.push(Message::exit(a, a));
        router.join().unwrap();
        Ok(())
    }
}
