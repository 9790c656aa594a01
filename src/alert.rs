//! The alert dispatcher.
//!
//! One task reads the shared alert line, drains every port's alert register and hands the alerts
//! to the port tasks in the order they were read. A port that raises alerts far faster than any
//! real protocol traffic could is considered storming: its alerts are held back and handed over in
//! one batch after a delay. Storms change when alerts arrive, never which alerts or in what order.
use embassy_futures::select::select;
use heapless::{Deque, Vec};
use typec_pd_traits::{Alert, AlertSource, PortId, TcpcError};

use crate::config::{MAX_PORTS, StormConfig};
use crate::port::Context;
use crate::timers::Timer;

/// Alerts that are held back per port. Further alerts are merged into the newest one.
pub const PENDING_LEN: usize = 8;

/// Delay before alerts are offered again to a port whose queue was full.
const FLUSH_RETRY_MS: u64 = 1;

/// Delay before the alert registers are read again, after a port controller failed.
const READ_RETRY_MS: u64 = 10;

/// What to do with an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Verdict {
    /// Hand it over now.
    Deliver,
    /// The port is storming, hold it back.
    Defer,
    /// This alert started a storm, hold it back.
    StormDetected,
}

/// Storm detection for one port.
#[derive(Debug, Clone)]
pub struct StormGuard {
    config: StormConfig,
    count: u32,
    window_start: u64,
    last_alert: Option<u64>,
    resume_at: Option<u64>,
}

impl StormGuard {
    /// A guard that saw no alerts yet.
    pub fn new(config: StormConfig) -> Self {
        Self {
            config,
            count: 0,
            window_start: 0,
            last_alert: None,
            resume_at: None,
        }
    }

    /// Count an alert that was read at `now`.
    pub fn record(&mut self, now: u64) -> Verdict {
        let idle = self
            .last_alert
            .is_none_or(|last| now.saturating_sub(last) >= self.config.idle_gap_ms);

        if idle {
            // A quiet line ends the burst, and with it any deferral.
            self.count = 0;
            self.window_start = now;
            self.resume_at = None;
        } else if now.saturating_sub(self.window_start) >= self.config.window_ms {
            self.count = 0;
            self.window_start = now;
        }

        self.count += 1;
        self.last_alert = Some(now);

        if self.resume_at.is_some() {
            Verdict::Defer
        } else if self.count > self.config.max_count {
            self.resume_at = Some(now + self.config.resume_delay_ms);
            Verdict::StormDetected
        } else {
            Verdict::Deliver
        }
    }

    /// Whether alerts are being held back.
    pub fn is_deferring(&self) -> bool {
        self.resume_at.is_some()
    }

    /// Whether the deferral is over.
    pub fn resume_due(&self, now: u64) -> bool {
        self.resume_at.is_some_and(|resume_at| now >= resume_at)
    }

    /// End the deferral, the held back alerts may be handed over.
    pub fn resume(&mut self) {
        self.resume_at = None;
        self.count = 0;
    }

    /// The end of the deferral.
    pub fn deadline(&self) -> Option<u64> {
        self.resume_at
    }
}

/// Reads alerts and hands them to the ports.
pub struct AlertDispatcher<'a, SOURCE: AlertSource, TIMER: Timer> {
    context: &'a Context,
    source: SOURCE,
    guards: Vec<StormGuard, MAX_PORTS>,
    pending: Vec<Deque<Alert, PENDING_LEN>, MAX_PORTS>,
    resumes: u32,
    _timer: core::marker::PhantomData<TIMER>,
}

impl<'a, SOURCE: AlertSource, TIMER: Timer> AlertDispatcher<'a, SOURCE, TIMER> {
    /// Create a dispatcher for all ports of a context.
    pub fn new(context: &'a Context, source: SOURCE, config: StormConfig) -> Self {
        Self {
            context,
            source,
            guards: (0..context.num_ports()).map(|_| StormGuard::new(config)).collect(),
            pending: (0..context.num_ports()).map(|_| Deque::new()).collect(),
            resumes: 0,
            _timer: core::marker::PhantomData,
        }
    }

    /// The alert source.
    pub fn source(&mut self) -> &mut SOURCE {
        &mut self.source
    }

    /// The number of deferrals that ended by their delay.
    pub fn resumes(&self) -> u32 {
        self.resumes
    }

    /// The number of alerts that were not handed over yet.
    pub fn pending(&self) -> usize {
        self.pending.iter().map(Deque::len).sum()
    }

    /// Read every port's alert register until it is empty.
    ///
    /// A port whose controller fails is skipped until the next drain, its alerts stay asserted.
    /// Returns `false` if any port was skipped.
    pub async fn drain(&mut self, now: u64) -> bool {
        let mut complete = true;

        for index in 0..self.guards.len() {
            if let Err(error) = self.drain_port(index, now).await {
                warn!("Port {}: reading alerts failed: {:?}", index, error);
                complete = false;
            }
        }

        complete
    }

    async fn drain_port(&mut self, index: usize, now: u64) -> Result<(), TcpcError> {
        let port = PortId(index as u8);

        loop {
            let alert = self.source.read_alert_status(port).await?;
            if alert.is_empty() {
                return Ok(());
            }
            self.source.clear_alert(port, alert).await?;
            self.hold(index, alert);

            match self.guards[index].record(now) {
                Verdict::Deliver => self.flush(index),
                Verdict::Defer => (),
                Verdict::StormDetected => {
                    warn!("Port {}: alert storm, deferring", index);
                }
            }
        }
    }

    /// End due deferrals and hand over what the ports can take.
    pub fn process_deadlines(&mut self, now: u64) {
        for index in 0..self.guards.len() {
            if self.guards[index].resume_due(now) {
                info!("Port {}: resuming after alert storm", index);
                self.guards[index].resume();
                self.resumes += 1;
            }

            if !self.guards[index].is_deferring() {
                self.flush(index);
            }
        }
    }

    /// The next time at which [`Self::process_deadlines`] has work.
    pub fn next_deadline(&self, now: u64) -> Option<u64> {
        self.guards
            .iter()
            .zip(self.pending.iter())
            .filter_map(|(guard, pending)| match guard.deadline() {
                Some(deadline) => Some(deadline),
                None if !pending.is_empty() => Some(now + FLUSH_RETRY_MS),
                None => None,
            })
            .min()
    }

    /// Dispatch alerts forever.
    ///
    /// Port controller failures are retried, they never end the dispatcher.
    pub async fn run(&mut self) {
        loop {
            let now = TIMER::now_millis();
            let deadline = self.next_deadline(now);
            let timeout = async {
                match deadline {
                    Some(deadline) => TIMER::after_millis(deadline.saturating_sub(now)).await,
                    None => core::future::pending().await,
                }
            };
            select(self.source.wait_for_alert(), timeout).await;

            let now = TIMER::now_millis();
            let complete = self.drain(now).await;
            self.process_deadlines(now);

            if !complete {
                TIMER::after_millis(READ_RETRY_MS).await;
            }
        }
    }

    fn hold(&mut self, index: usize, alert: Alert) {
        let pending = &mut self.pending[index];

        if let Err(alert) = pending.push_back(alert) {
            // Alerts are bit masks, merging keeps every event.
            if let Some(newest) = pending.back_mut() {
                *newest |= alert;
            }
        }
    }

    fn flush(&mut self, index: usize) {
        let Ok(shared) = self.context.shared(PortId(index as u8)) else {
            return;
        };
        let pending = &mut self.pending[index];

        while let Some(alert) = pending.front() {
            if shared.post_alert(*alert).is_err() {
                break;
            }
            pending.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, Reduction, SlotConfig};
    use crate::dummy::{DummyAlertSource, DummyTimer};

    const PORT: PortId = PortId(0);

    fn context() -> Context {
        Context::new(&BudgetConfig {
            capacity_ma: 3_000,
            base_load_ma: 0,
            slots: [
                SlotConfig::new(&[1_500, 500], 1, 500),
                SlotConfig::new(&[1_500, 500], 1, 500),
            ]
            .into_iter()
            .collect(),
            reduction: Reduction::OneAtATime,
        })
        .unwrap()
    }

    /// Feed one alert per millisecond, then let time pass until nothing is held back.
    async fn burst(context: &Context, count: u64) -> AlertDispatcher<'_, DummyAlertSource, DummyTimer> {
        let mut dispatcher = AlertDispatcher::new(context, DummyAlertSource::new(2), StormConfig::default());
        let shared = context.shared(PORT).unwrap();
        let mut received = 0;

        for now in 0..count {
            dispatcher.source().inject(PORT, Alert::CC_STATUS);
            assert!(dispatcher.drain(now).await);
            while shared.take_alert().is_some() {
                received += 1;
            }
        }

        let mut now = count;
        while dispatcher.pending() > 0 {
            now = dispatcher.next_deadline(now).unwrap();
            dispatcher.process_deadlines(now);
            while shared.take_alert().is_some() {
                received += 1;
            }
        }

        assert!(received > 0 && received <= count);
        assert_eq!(dispatcher.source().cleared.len() as u64, count);
        dispatcher
    }

    #[tokio::test]
    async fn storm_triggered() {
        let context = context();
        let dispatcher = burst(&context, 1000).await;

        assert_eq!(dispatcher.resumes(), 1);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn storm_not_triggered() {
        let context = context();
        let dispatcher = burst(&context, 100).await;

        assert_eq!(dispatcher.resumes(), 0);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn order_is_kept() {
        let context = context();
        let mut dispatcher =
            AlertDispatcher::<_, DummyTimer>::new(&context, DummyAlertSource::new(2), StormConfig::default());

        let alerts = [Alert::CC_STATUS, Alert::RX_STATUS, Alert::TX_SUCCESS, Alert::POWER_STATUS];
        for alert in alerts {
            dispatcher.source().inject(PORT, alert);
        }
        dispatcher.source().inject(PortId(1), Alert::FAULT);
        assert!(dispatcher.drain(0).await);

        let shared = context.shared(PORT).unwrap();
        for alert in alerts {
            assert_eq!(shared.take_alert(), Some(alert));
        }
        assert_eq!(shared.take_alert(), None);
        assert_eq!(context.shared(PortId(1)).unwrap().take_alert(), Some(Alert::FAULT));
    }

    #[tokio::test]
    async fn full_port_queue_merges_without_loss() {
        let context = context();
        let mut dispatcher =
            AlertDispatcher::<_, DummyTimer>::new(&context, DummyAlertSource::new(2), StormConfig::default());

        // The port takes nothing while these arrive.
        for _ in 0..crate::port::ALERT_QUEUE_LEN + PENDING_LEN {
            dispatcher.source().inject(PORT, Alert::RX_STATUS);
        }
        dispatcher.source().inject(PORT, Alert::TX_FAILED);
        assert!(dispatcher.drain(0).await);
        assert_eq!(dispatcher.pending(), PENDING_LEN);

        let shared = context.shared(PORT).unwrap();
        let mut merged = Alert::NONE;
        while dispatcher.pending() > 0 {
            while let Some(alert) = shared.take_alert() {
                merged |= alert;
            }
            dispatcher.process_deadlines(1);
        }
        while let Some(alert) = shared.take_alert() {
            merged |= alert;
        }

        assert!(merged.contains(Alert::RX_STATUS | Alert::TX_FAILED));
    }

    #[tokio::test]
    async fn failed_read_skips_port_once() {
        let context = context();
        let mut dispatcher =
            AlertDispatcher::<_, DummyTimer>::new(&context, DummyAlertSource::new(2), StormConfig::default());

        dispatcher.source().inject(PORT, Alert::RX_STATUS);
        dispatcher.source().inject(PortId(1), Alert::CC_STATUS);
        dispatcher.source().fail_next_read = Some(PORT);

        assert!(!dispatcher.drain(0).await);
        assert_eq!(context.shared(PORT).unwrap().take_alert(), None);
        assert_eq!(context.shared(PortId(1)).unwrap().take_alert(), Some(Alert::CC_STATUS));

        // The alert is still in the register, the next drain picks it up.
        assert!(dispatcher.drain(1).await);
        assert_eq!(context.shared(PORT).unwrap().take_alert(), Some(Alert::RX_STATUS));
    }

    #[test]
    fn idle_gap_cancels_deferral() {
        let mut guard = StormGuard::new(StormConfig::default());

        for now in 0..480 {
            assert_eq!(guard.record(now), Verdict::Deliver);
        }
        assert_eq!(guard.record(480), Verdict::StormDetected);
        assert_eq!(guard.record(481), Verdict::Defer);
        assert_eq!(guard.deadline(), Some(1480));

        // A regular alert after a quiet period.
        assert_eq!(guard.record(600), Verdict::Deliver);
        assert!(!guard.is_deferring());
        assert!(!guard.resume_due(2000));
    }

    #[test]
    fn window_restarts_count() {
        let config = StormConfig::default();
        let mut guard = StormGuard::new(config);

        // Below the limit in every window, with no idle gap in between.
        for now in 0..3 * config.window_ms {
            if now % 3 == 0 {
                assert_ne!(guard.record(now), Verdict::StormDetected);
            }
        }
        assert!(!guard.is_deferring());
    }
}
