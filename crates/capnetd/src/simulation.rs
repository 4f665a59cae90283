//! In-process simulation: one broker, N providers and M requesters as actors.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use capnet_agent::{
    run_party, Broker, BrokerStats, InMemoryNetwork, Provider, Requester, RequesterPhase,
    TokioClock,
};
use capnet_market::{InMemoryRegistry, JsonFileRegistry, ProviderRegistry};
use capnet_proto::PartyId;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SimulationConfig;
use crate::error::DaemonError;

/// How long requesters wait for providers to register before starting anyway.
pub const REGISTRATION_GRACE: Duration = Duration::from_secs(5);

/// Final state of one requester.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RequesterSummary {
    /// Requester address.
    pub id: String,
    /// Jobs completed.
    pub completed: u32,
    /// Jobs given up on after the completion wait expired.
    pub lost: u32,
    /// Calls for proposal sent.
    pub requests_sent: u32,
    /// Whether every configured job completed.
    pub finished: bool,
}

/// Final state of one provider.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProviderSummary {
    /// Provider address.
    pub id: String,
    /// Jobs reported done.
    pub jobs_done: u32,
    /// Jobs still queued at shutdown.
    pub queued: usize,
    /// Registration phase at shutdown.
    pub phase: String,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SimulationReport {
    /// Calls for proposal received by the broker.
    pub cfps: u64,
    /// Calls without an eligible provider.
    pub no_match: u64,
    /// Offers accepted.
    pub confirmed: u64,
    /// Offers rejected.
    pub rejected: u64,
    /// Offers that expired undecided.
    pub expired: u64,
    /// Completions relayed.
    pub completed: u64,
    /// Per-requester outcomes.
    pub requesters: Vec<RequesterSummary>,
    /// Per-provider outcomes.
    pub providers: Vec<ProviderSummary>,
}

impl SimulationReport {
    fn new(stats: BrokerStats, requesters: Vec<RequesterSummary>, providers: Vec<ProviderSummary>) -> Self {
        Self {
            cfps: stats.cfps,
            no_match: stats.no_match,
            confirmed: stats.confirmed,
            rejected: stats.rejected,
            expired: stats.expired,
            completed: stats.completed,
            requesters,
            providers,
        }
    }

    /// Returns true if every requester finished all of its jobs.
    pub fn all_finished(&self) -> bool {
        self.requesters.iter().all(|r| r.finished)
    }
}

/// A configured simulation ready to run.
#[derive(Debug)]
pub struct Simulation {
    config: SimulationConfig,
    network: Arc<InMemoryNetwork>,
}

impl Simulation {
    /// Creates a simulation on a fresh in-memory network.
    pub fn new(config: SimulationConfig) -> Self {
        Self::with_network(config, Arc::new(InMemoryNetwork::new()))
    }

    /// Creates a simulation on `network`, e.g. one with drop rules installed.
    pub fn with_network(config: SimulationConfig, network: Arc<InMemoryNetwork>) -> Self {
        Self { config, network }
    }

    /// The network parties talk over.
    pub fn network(&self) -> &Arc<InMemoryNetwork> {
        &self.network
    }

    /// Runs until every requester finishes, the time limit passes or `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a party task fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SimulationReport, DaemonError> {
        self.config.validate()?;

        let registry: Arc<dyn ProviderRegistry> = match &self.config.broker.registry_path {
            Some(path) => Arc::new(JsonFileRegistry::open(path)),
            None => Arc::new(InMemoryRegistry::new()),
        };
        let clock = TokioClock::new();
        let stop = shutdown.child_token();
        // Broker and providers stop when the requesters are done
        let background = stop.child_token();

        let broker_config = self.config.broker_config()?;
        let broker_inbox = self.network.register(broker_config.id.clone());
        let broker = Broker::new(broker_config, registry);
        let joins = broker.subscribe_joins();
        let broker = tokio::spawn(run_party(
            broker,
            broker_inbox,
            Arc::clone(&self.network),
            clock,
            background.clone(),
        ));

        let provider_configs = self.config.provider_configs()?;
        let expected_providers = provider_configs.len();
        let expected: BTreeSet<PartyId> = provider_configs.iter().map(|c| c.id.clone()).collect();
        let providers: Vec<JoinHandle<Provider>> = provider_configs
            .into_iter()
            .map(|config| {
                let inbox = self.network.register(config.id.clone());
                tokio::spawn(run_party(
                    Provider::new(config),
                    inbox,
                    Arc::clone(&self.network),
                    clock,
                    background.clone(),
                ))
            })
            .collect();

        wait_for_registrations(joins, &expected).await;

        let requesters: Vec<JoinHandle<Requester>> = self
            .config
            .requester_configs()?
            .into_iter()
            .map(|config| {
                let inbox = self.network.register(config.id.clone());
                tokio::spawn(run_party(
                    Requester::new(config),
                    inbox,
                    Arc::clone(&self.network),
                    clock,
                    stop.clone(),
                ))
            })
            .collect();
        info!(
            providers = expected_providers,
            requesters = requesters.len(),
            "simulation started"
        );

        let time_limit = self.config.time_limit_secs.map(Duration::from_secs);
        let watchdog = stop.clone();
        let limit_task = tokio::spawn(async move {
            if let Some(limit) = time_limit {
                tokio::time::sleep(limit).await;
                warn!(limit_secs = limit.as_secs(), "time limit reached, stopping simulation");
                watchdog.cancel();
            }
        });

        let mut requester_summaries = Vec::with_capacity(requesters.len());
        for handle in requesters {
            let requester = handle.await?;
            requester_summaries.push(RequesterSummary {
                id: requester.config().id.to_string(),
                completed: requester.completed(),
                lost: requester.lost(),
                requests_sent: requester.requests_sent(),
                finished: requester.phase() == RequesterPhase::Finished,
            });
        }
        limit_task.abort();
        background.cancel();

        let mut provider_summaries = Vec::with_capacity(providers.len());
        for handle in providers {
            let provider = handle.await?;
            provider_summaries.push(ProviderSummary {
                id: provider.config().id.to_string(),
                jobs_done: provider.jobs_done(),
                queued: provider.scheduler().len(),
                phase: provider.phase().to_string(),
            });
        }
        let broker = broker.await?;

        let report = SimulationReport::new(broker.stats(), requester_summaries, provider_summaries);
        info!(
            cfps = report.cfps,
            confirmed = report.confirmed,
            rejected = report.rejected,
            expired = report.expired,
            completed = report.completed,
            all_finished = report.all_finished(),
            "simulation finished"
        );
        Ok(report)
    }
}

/// Waits until every configured provider has joined the broker in this run.
async fn wait_for_registrations(mut joins: watch::Receiver<BTreeSet<PartyId>>, expected: &BTreeSet<PartyId>) {
    let waited = tokio::time::timeout(REGISTRATION_GRACE, joins.wait_for(|joined| joined.is_superset(expected))).await;
    match waited {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => warn!("broker stopped before providers registered"),
        Err(_) => warn!(
            expected = expected.len(),
            "not every provider registered in time, starting requesters anyway"
        ),
    }
}
