//! Statistical anomaly detector — learning/active/cooldown over baselines.
//!
//! The detector samples every registered skill on a periodic tick. During
//! learning it only buffers; once the learning window closes it freezes
//! per-metric baselines and starts scoring fresh samples against them. A
//! metric that stays beyond the z-threshold for enough consecutive samples
//! trips a notification onto the alert bus, after which the detector cools
//! down before arming again.
//!
//! Detection always scores against the frozen snapshot baseline. A separate
//! EMA copy tracks recent behavior so the reference cannot chase a drifting
//! metric.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamlens_bus::AlertBus;
use beamlens_core::telemetry::{TelemetryBus, TelemetryEvent};
use beamlens_core::{
    Baseline, MetricSample, MetricSnapshot, Notification, Severity, SkillId, SkillRegistry,
};

use crate::{BaselineStore, MetricStore};

/// Guards the z-score division when a baseline has zero spread.
const STD_DEV_EPSILON: f64 = 1e-9;

/// Detector tuning.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// How often the spawned loop ticks.
    pub collection_interval: std::time::Duration,

    /// How long to buffer samples before computing baselines.
    pub learning_duration: ChronoDuration,

    /// |z| at or above this is anomalous.
    pub z_threshold: f64,

    /// Consecutive anomalous samples required to trip.
    pub consecutive_required: u32,

    /// How long to stay quiet after tripping.
    pub cooldown: ChronoDuration,

    /// Baselines built from fewer samples are never used.
    pub min_required_samples: usize,

    /// Sample history retention.
    pub history_window: ChronoDuration,

    /// Smoothing factor for the EMA copy.
    pub ema_alpha: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            collection_interval: std::time::Duration::from_secs(30),
            learning_duration: ChronoDuration::minutes(30),
            z_threshold: 3.0,
            consecutive_required: 3,
            cooldown: ChronoDuration::minutes(5),
            min_required_samples: 10,
            history_window: ChronoDuration::minutes(60),
            ema_alpha: 0.1,
        }
    }
}

/// The detector's phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    Learning,
    Active,
    Cooldown,
}

impl DetectorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorPhase::Learning => "learning",
            DetectorPhase::Active => "active",
            DetectorPhase::Cooldown => "cooldown",
        }
    }
}

/// The anomaly detector worker.
pub struct AnomalyDetector {
    config: DetectorConfig,
    phase: DetectorPhase,
    learning_started: Option<DateTime<Utc>>,
    cooldown_started: Option<DateTime<Utc>>,
    metrics: MetricStore,
    baselines: BaselineStore,
    ema: BTreeMap<(SkillId, String), Baseline>,
    consecutive: BTreeMap<(SkillId, String), u32>,
    skills: Arc<SkillRegistry>,
    bus: Arc<AlertBus>,
    telemetry: Arc<TelemetryBus>,
    node: String,
}

impl AnomalyDetector {
    /// Build a detector. A baseline store with persisted entries skips the
    /// learning phase and arms immediately.
    pub fn new(
        config: DetectorConfig,
        skills: Arc<SkillRegistry>,
        baselines: BaselineStore,
        bus: Arc<AlertBus>,
        telemetry: Arc<TelemetryBus>,
        node: impl Into<String>,
    ) -> Self {
        let phase = if baselines.is_empty() {
            DetectorPhase::Learning
        } else {
            DetectorPhase::Active
        };
        let metrics = MetricStore::new(config.history_window);
        Self {
            config,
            phase,
            learning_started: None,
            cooldown_started: None,
            metrics,
            baselines,
            ema: BTreeMap::new(),
            consecutive: BTreeMap::new(),
            skills,
            bus,
            telemetry,
            node: node.into(),
        }
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    /// The frozen detection baseline for one (skill, metric).
    pub fn baseline(&self, skill: &SkillId, metric: &str) -> Option<&Baseline> {
        self.baselines.get(skill, metric)
    }

    /// The adaptive EMA copy for one (skill, metric).
    pub fn ema_baseline(&self, skill: &SkillId, metric: &str) -> Option<&Baseline> {
        self.ema.get(&(skill.clone(), metric.to_string()))
    }

    /// One collect tick at the given instant.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let snapshots = self.sample_all(now);

        match self.phase {
            DetectorPhase::Learning => {
                let started = *self.learning_started.get_or_insert(now);
                if now - started >= self.config.learning_duration {
                    self.compute_baselines();
                    self.set_phase(DetectorPhase::Active);
                }
            }
            DetectorPhase::Active => self.detect(&snapshots, now),
            DetectorPhase::Cooldown => {
                let expired = self
                    .cooldown_started
                    .is_some_and(|started| now - started >= self.config.cooldown);
                if expired {
                    self.cooldown_started = None;
                    self.set_phase(DetectorPhase::Active);
                }
            }
        }
    }

    /// Persist the snapshot baselines.
    pub fn flush(&self) -> Result<(), beamlens_core::Error> {
        self.baselines.flush()
    }

    /// Run the tick loop until cancelled, flushing baselines on the way out.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.collection_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => self.tick(Utc::now()),
                }
            }
            if let Err(e) = self.flush() {
                warn!(error = %e, "Baseline flush on shutdown failed");
            }
        })
    }

    /// Take one snapshot per skill and buffer every metric as a sample.
    fn sample_all(&mut self, now: DateTime<Utc>) -> Vec<MetricSnapshot> {
        let mut snapshots = Vec::new();
        for skill in self.skills.iter() {
            let mut snapshot = skill.snapshot();
            snapshot.taken_at = now;
            for (metric, value) in &snapshot.metrics {
                let mut sample = MetricSample::new(snapshot.skill.clone(), metric.clone(), *value);
                sample.timestamp = now;
                self.metrics.record(sample);
            }
            snapshots.push(snapshot);
        }
        snapshots
    }

    /// Freeze baselines from everything buffered during learning.
    fn compute_baselines(&mut self) {
        let mut computed = 0usize;
        for (skill, metric) in self.metrics.keys() {
            let values = self.metrics.values(&skill, &metric);
            if values.len() < self.config.min_required_samples {
                debug!(
                    skill = %skill,
                    metric = %metric,
                    samples = values.len(),
                    "Too few samples for a baseline"
                );
                continue;
            }
            if let Some(baseline) = Baseline::from_values(&values) {
                self.ema
                    .insert((skill.clone(), metric.clone()), baseline.clone());
                self.baselines.insert(skill, metric, baseline);
                computed += 1;
            }
        }
        info!(baselines = computed, "Learning complete, baselines frozen");
        if let Err(e) = self.baselines.flush() {
            warn!(error = %e, "Baseline persistence failed");
        }
    }

    /// Score fresh samples against frozen baselines; trip on enough
    /// consecutive anomalous samples.
    fn detect(&mut self, snapshots: &[MetricSnapshot], now: DateTime<Utc>) {
        struct Tripped {
            skill: SkillId,
            metric: String,
            value: f64,
            z: f64,
            baseline: Baseline,
            snapshot: MetricSnapshot,
        }
        let mut tripped: Vec<Tripped> = Vec::new();

        for snapshot in snapshots {
            for (metric, value) in &snapshot.metrics {
                let key = (snapshot.skill.clone(), metric.clone());
                let Some(baseline) = self.baselines.get(&snapshot.skill, metric) else {
                    continue;
                };
                if baseline.sample_count < self.config.min_required_samples {
                    continue;
                }

                let z = (value - baseline.mean) / baseline.std_dev.max(STD_DEV_EPSILON);
                let frozen = baseline.clone();

                // Track recent behavior without moving the detection reference
                let alpha = self.config.ema_alpha;
                self.ema
                    .entry(key.clone())
                    .or_insert_with(|| frozen.clone())
                    .ema_update(*value, alpha);

                if z.abs() >= self.config.z_threshold {
                    let count = self.consecutive.entry(key).or_insert(0);
                    *count += 1;
                    if *count >= self.config.consecutive_required {
                        tripped.push(Tripped {
                            skill: snapshot.skill.clone(),
                            metric: metric.clone(),
                            value: *value,
                            z,
                            baseline: frozen,
                            snapshot: snapshot.clone(),
                        });
                    }
                } else {
                    self.consecutive.insert(key, 0);
                }
            }
        }

        if tripped.is_empty() {
            return;
        }

        // One notification per tripped metric, in stable (skill, metric) order
        tripped.sort_by(|a, b| (&a.skill, &a.metric).cmp(&(&b.skill, &b.metric)));
        for t in tripped {
            let severity = if t.z.abs() >= 2.0 * self.config.z_threshold {
                Severity::Critical
            } else {
                Severity::Warning
            };

            let notification = Notification::new(
                t.skill.clone(),
                format!("{}_anomaly", t.metric),
                severity,
                format!(
                    "baseline mean={:.3} std_dev={:.3} from {} samples",
                    t.baseline.mean, t.baseline.std_dev, t.baseline.sample_count
                ),
                format!(
                    "{}={:.3} z={:.2} for {} consecutive samples",
                    t.metric, t.value, t.z, self.config.consecutive_required
                ),
                self.node.clone(),
            )
            .with_snapshots(vec![t.snapshot]);

            info!(
                skill = %t.skill,
                metric = %t.metric,
                z = t.z,
                "Anomaly tripped, emitting notification"
            );
            self.bus.push(notification);
        }

        self.cooldown_started = Some(now);
        self.consecutive.clear();
        self.set_phase(DetectorPhase::Cooldown);
    }

    fn set_phase(&mut self, to: DetectorPhase) {
        let from = self.phase;
        self.phase = to;
        debug!(from = from.as_str(), to = to.as_str(), "Detector phase change");
        self.telemetry.publish(TelemetryEvent::MonitorPhaseChange {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beamlens_core::{CallbackSpec, Skill, SkillError};
    use std::sync::Mutex;

    /// A skill whose single metric value is set by the test.
    struct DialSkill {
        value: Arc<Mutex<f64>>,
    }

    #[async_trait]
    impl Skill for DialSkill {
        fn id(&self) -> SkillId {
            SkillId::new("dial")
        }
        fn title(&self) -> &str {
            "Dial"
        }
        fn description(&self) -> &str {
            "Test skill with a controllable metric"
        }
        fn system_prompt(&self) -> &str {
            "n/a"
        }
        fn snapshot(&self) -> MetricSnapshot {
            let mut metrics = BTreeMap::new();
            metrics.insert("load".into(), *self.value.lock().unwrap());
            MetricSnapshot::new(self.id(), metrics)
        }
        fn callback_specs(&self) -> Vec<CallbackSpec> {
            vec![]
        }
        async fn run_callback(
            &self,
            name: &str,
            _args: serde_json::Value,
        ) -> Result<serde_json::Value, SkillError> {
            Err(SkillError::UnknownCallback(name.to_string()))
        }
    }

    struct Harness {
        detector: AnomalyDetector,
        bus: Arc<AlertBus>,
        value: Arc<Mutex<f64>>,
        now: DateTime<Utc>,
    }

    impl Harness {
        fn new(consecutive_required: u32) -> Self {
            let value = Arc::new(Mutex::new(10.0));
            let mut registry = SkillRegistry::new();
            registry.register(Arc::new(DialSkill {
                value: value.clone(),
            }));

            let telemetry = Arc::new(TelemetryBus::default());
            let bus = Arc::new(AlertBus::new(telemetry.clone()));
            let config = DetectorConfig {
                learning_duration: ChronoDuration::seconds(60),
                z_threshold: 3.0,
                consecutive_required,
                cooldown: ChronoDuration::seconds(120),
                min_required_samples: 3,
                ..DetectorConfig::default()
            };
            let detector = AnomalyDetector::new(
                config,
                Arc::new(registry),
                BaselineStore::in_memory(),
                bus.clone(),
                telemetry,
                "node-a",
            );
            Self {
                detector,
                bus,
                value,
                now: Utc::now(),
            }
        }

        fn tick(&mut self, advance_secs: i64) {
            self.now += ChronoDuration::seconds(advance_secs);
            self.detector.tick(self.now);
        }

        fn set(&self, v: f64) {
            *self.value.lock().unwrap() = v;
        }

        /// Ticks through the 60s learning window with the current value.
        fn learn(&mut self) {
            self.tick(0);
            self.tick(30);
            self.tick(30);
            assert_eq!(self.detector.phase(), DetectorPhase::Active);
        }
    }

    #[test]
    fn learning_freezes_baselines_then_arms() {
        let mut h = Harness::new(3);
        assert_eq!(h.detector.phase(), DetectorPhase::Learning);
        h.learn();

        let baseline = h.detector.baseline(&SkillId::new("dial"), "load").unwrap();
        assert!((baseline.mean - 10.0).abs() < 1e-10);
        assert_eq!(baseline.sample_count, 3);
    }

    #[test]
    fn fewer_than_required_consecutive_never_trips() {
        let mut h = Harness::new(3);
        h.learn();

        h.set(100.0);
        h.tick(30);
        h.tick(30);
        assert_eq!(h.bus.count(), 0);

        // A normal sample resets the streak
        h.set(10.0);
        h.tick(30);
        h.set(100.0);
        h.tick(30);
        h.tick(30);
        assert_eq!(h.bus.count(), 0);
        assert_eq!(h.detector.phase(), DetectorPhase::Active);
    }

    #[test]
    fn exactly_required_consecutive_trips_once() {
        let mut h = Harness::new(3);
        h.learn();

        h.set(100.0);
        h.tick(30);
        h.tick(30);
        h.tick(30);

        let drained = h.bus.take_all();
        assert_eq!(drained.len(), 1);
        let n = &drained[0];
        assert_eq!(n.anomaly_type, "load_anomaly");
        assert_eq!(n.operator, SkillId::new("dial"));
        assert_eq!(n.severity, Severity::Critical);
        assert_eq!(n.snapshots.len(), 1);
        assert_eq!(h.detector.phase(), DetectorPhase::Cooldown);
    }

    #[test]
    fn cooldown_suppresses_then_rearms() {
        let mut h = Harness::new(2);
        h.learn();

        h.set(100.0);
        h.tick(30);
        h.tick(30);
        assert_eq!(h.bus.take_all().len(), 1);
        assert_eq!(h.detector.phase(), DetectorPhase::Cooldown);

        // Still anomalous during cooldown: nothing is emitted
        h.tick(30);
        h.tick(30);
        assert_eq!(h.bus.count(), 0);

        // Cooldown (120s) expires, detector re-arms
        h.tick(60);
        assert_eq!(h.detector.phase(), DetectorPhase::Active);

        // And trips again after a fresh streak
        h.tick(30);
        h.tick(30);
        assert_eq!(h.bus.take_all().len(), 1);
    }

    #[test]
    fn ema_moves_while_detection_reference_stays() {
        let mut h = Harness::new(10);
        h.learn();

        h.set(100.0);
        h.tick(30);
        h.tick(30);

        let skill = SkillId::new("dial");
        let frozen = h.detector.baseline(&skill, "load").unwrap();
        assert!((frozen.mean - 10.0).abs() < 1e-10);

        let ema = h.detector.ema_baseline(&skill, "load").unwrap();
        assert!(ema.mean > frozen.mean);
    }

    #[test]
    fn persisted_baselines_skip_learning() {
        let mut store = BaselineStore::in_memory();
        store.insert(
            SkillId::new("dial"),
            "load",
            Baseline::from_values(&[10.0, 10.0, 10.0]).unwrap(),
        );

        let telemetry = Arc::new(TelemetryBus::default());
        let bus = Arc::new(AlertBus::new(telemetry.clone()));
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(DialSkill {
            value: Arc::new(Mutex::new(10.0)),
        }));

        let detector = AnomalyDetector::new(
            DetectorConfig::default(),
            Arc::new(registry),
            store,
            bus,
            telemetry,
            "node-a",
        );
        assert_eq!(detector.phase(), DetectorPhase::Active);
    }
}
