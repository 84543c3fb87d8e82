//! Simulate command implementation.
//!
//! Drives several engines against one in-process server with a seeded
//! random workload, lets the network settle, then compares every client's
//! subscriptions with the server's tables.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use synclane_engine::{EngineConfig, SubscriptionId, SyncQueryResult};
use synclane_testkit::{
    chat_server, expected_conversations, expected_messages, get_conversations, get_messages,
    ClientOp, HarnessResult, TestClient,
};
use synclane_value::{to_json, Value};
use tracing::info;

const CONVERSATION_IDS: [&str; 5] = ["a", "b", "c", "d", "e"];

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Random seed.
    pub seed: u64,
    /// Number of clients.
    pub clients: usize,
    /// Operations across all clients.
    pub steps: usize,
    /// Engine page size.
    pub page_size: u32,
}

/// Outcome of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    /// Random seed.
    pub seed: u64,
    /// Number of clients.
    pub clients: usize,
    /// Operations applied.
    pub steps: usize,
    /// Mutations submitted across all clients.
    pub mutations: usize,
    /// Reconnects and disconnects.
    pub interruptions: usize,
    /// Server version after settling.
    pub server_version: u64,
    /// Conversations on the server.
    pub conversations: usize,
    /// Messages on the server.
    pub messages: usize,
    /// One line per client view that disagrees with the server.
    pub divergences: Vec<String>,
}

impl SimulationReport {
    /// Returns true if every client converged.
    pub fn converged(&self) -> bool {
        self.divergences.is_empty()
    }
}

fn random_op(rng: &mut StdRng) -> ClientOp {
    let id = CONVERSATION_IDS[rng.gen_range(0..CONVERSATION_IDS.len())].to_string();
    match rng.gen_range(0..12) {
        0..=3 => ClientOp::CreateConversation {
            id,
            emoji: ["😀", "🎉", "🚀"][rng.gen_range(0..3)].to_string(),
        },
        4..=6 => ClientOp::SendMessage {
            conversation: id,
            body: format!("m{}", rng.gen::<u16>()),
        },
        7..=9 => ClientOp::Pump,
        10 => ClientOp::Reconnect,
        _ => ClientOp::Disconnect,
    }
}

struct SimClient {
    client: TestClient,
    conversations: SubscriptionId,
    messages: Vec<(&'static str, SubscriptionId)>,
}

/// Runs a simulation and reports how the clients ended up.
pub fn run_simulation(config: &SimulationConfig) -> HarnessResult<SimulationReport> {
    let server = chat_server();
    let engine_config = EngineConfig::default().with_page_size(config.page_size);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut clients: Vec<SimClient> = (0..config.clients)
        .map(|_| {
            let mut client = TestClient::with_config(server.clone(), engine_config.clone());
            let conversations = client.engine.watch(&get_conversations(), Value::Null);
            let messages = CONVERSATION_IDS
                .iter()
                .map(|id| {
                    let args = Value::object([("conversation", Value::from(*id))]);
                    (*id, client.engine.watch(&get_messages(), args))
                })
                .collect();
            SimClient {
                client,
                conversations,
                messages,
            }
        })
        .collect();

    let mut mutations = 0;
    let mut interruptions = 0;
    if !clients.is_empty() {
        for _ in 0..config.steps {
            let target = rng.gen_range(0..clients.len());
            let op = random_op(&mut rng);
            match op {
                ClientOp::CreateConversation { .. } | ClientOp::SendMessage { .. } => mutations += 1,
                ClientOp::Reconnect | ClientOp::Disconnect => interruptions += 1,
                ClientOp::Pump => {}
            }
            op.apply(&mut clients[target].client)?;
        }
    }

    // Two rounds: the second delivers writes made by later clients in the first.
    for _ in 0..2 {
        for sim in clients.iter_mut() {
            sim.client.connect();
            sim.client.pump()?;
        }
    }

    let expected = expected_conversations(&server)?;
    let mut divergences = Vec::new();
    for (i, sim) in clients.iter().enumerate() {
        let engine = &sim.client.engine;
        check(
            &mut divergences,
            format!("client {i} conversations"),
            engine.sync_query_result(sim.conversations),
            &expected,
        );
        for (id, sub) in &sim.messages {
            let expected = expected_messages(&server, id)?;
            check(
                &mut divergences,
                format!("client {i} messages of {id}"),
                engine.sync_query_result(*sub),
                &expected,
            );
        }
        if engine.pending_mutations() > 0 {
            divergences.push(format!(
                "client {i} has {} unreflected mutations",
                engine.pending_mutations()
            ));
        }
        if let Err(error) = engine.check_invariants() {
            divergences.push(format!("client {i}: {error}"));
        }
    }

    let report = SimulationReport {
        seed: config.seed,
        clients: config.clients,
        steps: config.steps,
        mutations,
        interruptions,
        server_version: server.version().0,
        conversations: server.documents(synclane_testkit::CONVERSATIONS)?.len(),
        messages: server.documents(synclane_testkit::MESSAGES)?.len(),
        divergences,
    };
    info!(seed = report.seed, converged = report.converged(), "simulation finished");
    Ok(report)
}

fn check(
    divergences: &mut Vec<String>,
    what: String,
    actual: Option<&SyncQueryResult>,
    expected: &Value,
) {
    match actual {
        Some(SyncQueryResult::Success(value)) if value == expected => {}
        other => divergences.push(format!(
            "{what}: expected {}, got {}",
            render(expected),
            match other {
                Some(SyncQueryResult::Success(value)) => render(value),
                Some(other) => format!("{other:?}"),
                None => "no subscription".to_string(),
            }
        )),
    }
}

fn render(value: &Value) -> String {
    to_json(value)
        .map(|json| json.to_string())
        .unwrap_or_else(|_| format!("{value:?}"))
}

/// Runs the simulate command.
pub fn run(config: &SimulationConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = run_simulation(config)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Simulation (seed {})", report.seed);
        println!("  Clients:        {}", report.clients);
        println!("  Steps:          {}", report.steps);
        println!("  Mutations:      {}", report.mutations);
        println!("  Interruptions:  {}", report.interruptions);
        println!("  Server version: {}", report.server_version);
        println!("  Conversations:  {}", report.conversations);
        println!("  Messages:       {}", report.messages);
        println!();
        for divergence in &report.divergences {
            println!("  ✗ {divergence}");
        }
    }

    if report.converged() {
        if format != "json" {
            println!("✓ All clients converged");
        }
        Ok(())
    } else {
        Err(format!("{} divergent views", report.divergences.len()).into())
    }
}
