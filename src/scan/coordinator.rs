//! 扫描协调器
//! 每台主机一个任务，结果经单一通道汇总后组装成快照

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Host, ScanSettings};
use crate::scan::channel::{ChannelFactory, DefaultChannels, ExecChannel};
use crate::scan::compose::{self, ComposeStack};
use crate::scan::container::Container;
use crate::scan::probe::{Partial, ProbeError};
use crate::scan::retry::with_retry;
use crate::scan::session::ScanSession;
use crate::scan::snapshot::{HostFacts, Snapshot};
use crate::scan::{collector, grouping, host as system};
use crate::utils::ProbeCategory;

/// Everything one host task produced.
#[derive(Debug)]
struct HostOutcome {
    facts: HostFacts,
    containers: Vec<Container>,
    stacks: Vec<ComposeStack>,
}

pub struct ScanCoordinator {
    settings: Arc<ScanSettings>,
    channels: Arc<dyn ChannelFactory>,
}

impl ScanCoordinator {
    pub fn new(settings: ScanSettings, channels: Arc<dyn ChannelFactory>) -> Self {
        Self { settings: Arc::new(settings), channels }
    }

    /// Local hosts over `sh`, everything else over `ssh`.
    pub fn with_default_channels(settings: ScanSettings) -> Self {
        let channels = Arc::new(DefaultChannels::new(settings.timeouts.connect));
        Self::new(settings, channels)
    }

    /// Scan every host. Never fails: host problems end up in the snapshot.
    pub async fn scan(&self, hosts: &[Host], session: &ScanSession) -> Snapshot {
        let started_at = Utc::now();
        let clock = Instant::now();
        session.begin(hosts.len());
        info!(hosts = hosts.len(), categories = ?self.settings.enabled, "scan started");

        let (tx, mut rx) = mpsc::channel::<(usize, HostOutcome)>(hosts.len().max(1));
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel_hosts.max(1)));
        let mut tasks = JoinSet::new();

        for (index, host) in hosts.iter().enumerate() {
            let host = host.clone();
            let channel = self.channels.open(&host);
            let settings = self.settings.clone();
            let token = session.token().clone();
            let permits = permits.clone();
            let tx = tx.clone();

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else { return };
                debug!(host = %host.name, channel = %channel.describe(), "host scan started");
                let outcome = scan_host(&host, channel.as_ref(), &settings, &token).await;
                let _ = tx.send((index, outcome)).await;
            });
        }
        drop(tx);

        // single writer: only this loop touches the results
        let mut outcomes: Vec<Option<HostOutcome>> = hosts.iter().map(|_| None).collect();
        let token = session.token().clone();
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some((index, outcome)) => {
                        session.host_finished();
                        outcomes[index] = Some(outcome);
                    }
                    None => break,
                },
                _ = token.cancelled() => {
                    warn!("scan cancelled, keeping partial results");
                    tasks.abort_all();
                    while let Ok((index, outcome)) = rx.try_recv() {
                        session.host_finished();
                        outcomes[index] = Some(outcome);
                    }
                    break;
                }
            }
        }
        while tasks.join_next().await.is_some() {}

        let mut snapshot = Snapshot::empty(started_at);
        let mut containers_by_host: BTreeMap<String, Vec<Container>> = BTreeMap::new();

        for (host, outcome) in hosts.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| cancelled_outcome(host));
            let facts = outcome.facts;
            if !facts.reachable {
                warn!(host = %facts.name, errors = facts.scan_errors.len(), "host unreachable");
            }
            snapshot.scan_errors.extend(facts.scan_errors.iter().cloned());
            snapshot.scan_warnings.extend(facts.warnings.iter().cloned());
            containers_by_host
                .entry(facts.name.clone())
                .or_default()
                .extend(outcome.containers);
            snapshot.compose_stacks.extend(outcome.stacks);
            snapshot.servers.push(facts);
        }

        snapshot.services = grouping::derive_services(&containers_by_host, &snapshot.compose_stacks);
        snapshot.scanners_used = self.settings.enabled.iter().copied().collect();
        snapshot.complete = !session.is_cancelled();
        snapshot.scan_duration_seconds = clock.elapsed().as_secs_f64();
        snapshot.canonicalize();
        session.finish();

        info!(
            servers = snapshot.total_servers,
            reachable = snapshot.reachable_servers(),
            services = snapshot.total_services,
            containers = snapshot.total_containers,
            running = snapshot.running_containers,
            errors = snapshot.scan_errors.len(),
            complete = snapshot.complete,
            duration_secs = snapshot.scan_duration_seconds,
            "scan finished"
        );
        snapshot
    }
}

// ── 单机扫描 ────────────────────────────────────────────────────────────────

async fn scan_host(
    host: &Host,
    channel: &dyn ExecChannel,
    settings: &ScanSettings,
    token: &CancellationToken,
) -> HostOutcome {
    let mut rec = Recorder::new(host);
    let enabled = |c: ProbeCategory| settings.enabled.contains(&c);

    // independent categories run side by side
    let facts_fut = async {
        if !enabled(ProbeCategory::HostFacts) {
            return None;
        }
        let deadline = settings.timeouts.for_category(ProbeCategory::HostFacts);
        Some(
            with_retry(&settings.retries, deadline, token, &label(host, ProbeCategory::HostFacts), |_| {
                system::probe(channel, deadline)
            })
            .await,
        )
    };
    let containers_fut = async {
        if !enabled(ProbeCategory::Containers) {
            return None;
        }
        let deadline = settings.timeouts.for_category(ProbeCategory::Containers);
        Some(
            with_retry(&settings.retries, deadline, token, &label(host, ProbeCategory::Containers), |_| {
                collector::probe(channel, deadline)
            })
            .await,
        )
    };
    let (facts_res, containers_res) = tokio::join!(facts_fut, containers_fut);

    let mut containers = Vec::new();
    if let Some(res) = facts_res {
        if let Some(system) = rec.take(ProbeCategory::HostFacts, res) {
            rec.facts.system = system;
        }
    }
    if let Some(res) = containers_res {
        containers = rec.take(ProbeCategory::Containers, res).unwrap_or_default();
    }

    // compose correlation needs the container inventory; skip it once the channel is gone
    let mut stacks = Vec::new();
    if enabled(ProbeCategory::ComposeFiles) && rec.facts.reachable && !settings.compose_paths.is_empty() {
        let deadline = settings.timeouts.for_category(ProbeCategory::ComposeFiles);
        let name = host.name.as_str();
        let paths = settings.compose_paths.as_slice();
        let res = with_retry(&settings.retries, deadline, token, &label(host, ProbeCategory::ComposeFiles), |_| {
            compose::probe(channel, name, paths, deadline)
        })
        .await;
        stacks = rec.take(ProbeCategory::ComposeFiles, res).unwrap_or_default();
    }

    rec.facts.last_scanned = Utc::now();
    HostOutcome { facts: rec.facts, containers, stacks }
}

fn label(host: &Host, category: ProbeCategory) -> String {
    format!("{}/{}", host.name, category)
}

/// Folds probe results into one host's facts.
struct Recorder {
    facts: HostFacts,
}

impl Recorder {
    fn new(host: &Host) -> Self {
        Self { facts: HostFacts::from_host(host, Utc::now()) }
    }

    fn take<T>(&mut self, category: ProbeCategory, res: Result<Partial<T>, ProbeError>) -> Option<T> {
        let name = self.facts.name.clone();
        match res {
            Ok(partial) => {
                for w in partial.warnings {
                    debug!(host = %name, %category, warning = %w, "probe warning");
                    self.facts.warnings.push(format!("{}: {}: {}", name, category, w));
                }
                Some(partial.value)
            }
            Err(e) => {
                warn!(host = %name, %category, error = %e, "probe failed");
                if e.is_channel_failure() {
                    self.facts.reachable = false;
                }
                self.facts.scan_errors.push(format!("{}: {}: {}", name, category, e));
                None
            }
        }
    }
}

fn cancelled_outcome(host: &Host) -> HostOutcome {
    let mut facts = HostFacts::from_host(host, Utc::now());
    facts.reachable = false;
    facts.scan_errors.push(format!("{}: {}", host.name, ProbeError::Cancelled));
    HostOutcome { facts, containers: Vec::new(), stacks: Vec::new() }
}
