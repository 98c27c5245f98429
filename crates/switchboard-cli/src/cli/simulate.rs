//! `swbd simulate`: echo agents exchanging messages over an in-memory bus.
//!
//! Every agent answers non-response messages with a response carrying the
//! same content, so each point-to-point send produces a two-message
//! conversation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value, json};
use switchboard_core::bus::{BusMetrics, EventBus};
use switchboard_core::router::{AgentHandler, AgentMessageStats, AgentRouter, agent_handler_fn};
use switchboard_core::subscription::HandlerError;
use switchboard_infra::directory::StaticAgentDirectory;
use switchboard_observe::messaging_attrs::{
    MESSAGING_BATCH_MESSAGE_COUNT, MESSAGING_OPERATION_TYPE, MESSAGING_SYSTEM, OP_PUBLISH,
    SYSTEM_NAME,
};
use switchboard_types::config::SwitchboardConfig;
use switchboard_types::message::{AgentMessage, MessageType};
use tracing::{Instrument, info, info_span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationPlan {
    pub agents: usize,
    pub messages: usize,
    pub broadcast: bool,
    pub fail_every: Option<usize>,
}

/// Outcome of a simulation run.
#[derive(Debug)]
pub struct SimulationReport {
    pub sent: usize,
    pub refused: usize,
    pub broadcast_recipients: Option<usize>,
    pub elapsed_ms: f64,
    pub metrics: BusMetrics,
    pub agents: Vec<AgentMessageStats>,
}

pub async fn run(config: &SwitchboardConfig, plan: &SimulationPlan, json: bool, quiet: bool) -> Result<()> {
    if plan.agents < 2 {
        bail!("simulate needs at least 2 agents, got {}", plan.agents);
    }
    if plan.fail_every == Some(0) {
        bail!("--fail-every must be at least 1");
    }

    let report = simulate(config, plan).await;

    if json {
        let out = json!({
            "sent": report.sent,
            "refused": report.refused,
            "broadcast_recipients": report.broadcast_recipients,
            "elapsed_ms": report.elapsed_ms,
            "metrics": report.metrics,
            "agents": report.agents,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if !quiet {
        print_report(&report);
    }
    Ok(())
}

fn agent_id(index: usize) -> String {
    format!("agent-{}", index + 1)
}

fn echo_handler(deliveries: Arc<AtomicUsize>, fail_every: Option<usize>) -> AgentHandler {
    agent_handler_fn(move |message: AgentMessage| {
        let deliveries = Arc::clone(&deliveries);
        async move {
            let n = deliveries.fetch_add(1, Ordering::SeqCst) + 1;
            if fail_every.is_some_and(|every| n % every == 0) {
                return Err(HandlerError::new(format!("simulated failure on delivery {n}")));
            }
            if message.message_type == MessageType::Response {
                return Ok(None);
            }
            Ok(Some(message.reply(message.content.clone())))
        }
    })
}

/// Build a bus and router from `config`, run the plan, and collect stats.
pub async fn simulate(config: &SwitchboardConfig, plan: &SimulationPlan) -> SimulationReport {
    let bus = Arc::new(EventBus::new(config.bus.clone()));
    let router = if config.agents.is_empty() {
        AgentRouter::new(Arc::clone(&bus), config.router.clone())
    } else {
        let directory = Arc::new(StaticAgentDirectory::from_config(config));
        AgentRouter::with_directory(Arc::clone(&bus), config.router.clone(), directory)
    };

    let deliveries = Arc::new(AtomicUsize::new(0));
    for index in 0..plan.agents {
        router
            .register_agent(&agent_id(index), echo_handler(deliveries.clone(), plan.fail_every))
            .await;
    }

    let started = Instant::now();
    let span = info_span!(
        "simulate",
        { MESSAGING_SYSTEM } = SYSTEM_NAME,
        { MESSAGING_OPERATION_TYPE } = OP_PUBLISH,
        { MESSAGING_BATCH_MESSAGE_COUNT } = plan.messages,
    );

    let (sent, refused, broadcast_recipients) = async {
        let mut sent = 0;
        let mut refused = 0;
        for i in 0..plan.messages {
            let sender = agent_id(i % plan.agents);
            let receiver = agent_id((i + 1) % plan.agents);
            let mut content = Map::new();
            content.insert("sequence".to_string(), Value::from(i));
            let message = AgentMessage::new(MessageType::Command, sender, receiver, content);
            if router.send_message(message).await {
                sent += 1;
            } else {
                refused += 1;
            }
        }

        let broadcast_recipients = if plan.broadcast {
            let mut content = Map::new();
            content.insert("announcement".to_string(), Value::from("hello"));
            let message = AgentMessage::new(MessageType::Notification, agent_id(0), "", content);
            Some(router.broadcast_message(&message, None).await)
        } else {
            None
        };
        (sent, refused, broadcast_recipients)
    }
    .instrument(span)
    .await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let mut agents = Vec::with_capacity(plan.agents);
    for index in 0..plan.agents {
        agents.push(router.get_agent_message_stats(&agent_id(index)).await);
    }
    let metrics = bus.get_metrics().await;
    info!(sent, refused, elapsed_ms, "simulation finished");

    router.shutdown().await;
    SimulationReport {
        sent,
        refused,
        broadcast_recipients,
        elapsed_ms,
        metrics,
        agents,
    }
}

fn print_report(report: &SimulationReport) {
    println!();
    println!(
        "  {} Switchboard v{}",
        style("⇄").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!("  {}", style("── Run ──").dim());
    println!("  Sent:     {}", style(report.sent).bold());
    if report.refused > 0 {
        println!("  Refused:  {}", style(report.refused).yellow());
    }
    if let Some(recipients) = report.broadcast_recipients {
        println!("  Broadcast recipients: {}", style(recipients).bold());
    }
    println!("  Elapsed:  {:.2} ms", report.elapsed_ms);
    println!();

    let m = &report.metrics;
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Metric").fg(Color::White),
        Cell::new("Value").fg(Color::White),
    ]);

    let rows: [(&str, String, Option<Color>); 12] = [
        ("published", m.events_published.to_string(), None),
        ("delivered", m.events_delivered.to_string(), Some(Color::Green)),
        ("failed", m.events_failed.to_string(), warn_if(m.events_failed)),
        ("retried", m.events_retried.to_string(), warn_if(m.events_retried)),
        ("dead-lettered", m.events_dead_lettered.to_string(), warn_if(m.events_dead_lettered)),
        ("skipped", m.deliveries_skipped.to_string(), warn_if(m.deliveries_skipped)),
        ("queued", m.deliveries_queued.to_string(), None),
        ("dropped", m.deliveries_dropped.to_string(), warn_if(m.deliveries_dropped)),
        ("stored events", m.stored_events.to_string(), None),
        ("subscriptions", format!("{}/{}", m.subscriptions_active, m.subscriptions_total), None),
        ("avg delivery", format!("{:.3} ms", m.avg_delivery_ms), None),
        ("max delivery", format!("{:.3} ms", m.max_delivery_ms), None),
    ];
    for (label, value, color) in rows {
        let cell = match color {
            Some(color) => Cell::new(value).fg(color),
            None => Cell::new(value),
        };
        table.add_row(vec![Cell::new(label), cell]);
    }
    println!("{table}");
    println!();

    let mut agents = Table::new();
    agents.load_preset(presets::UTF8_FULL_CONDENSED);
    agents.set_content_arrangement(ContentArrangement::Dynamic);
    agents.set_header(vec![
        Cell::new("Agent").fg(Color::White),
        Cell::new("Sent").fg(Color::White),
        Cell::new("Received").fg(Color::White),
        Cell::new("Conversations").fg(Color::White),
    ]);
    for stats in &report.agents {
        agents.add_row(vec![
            Cell::new(&stats.agent_id),
            Cell::new(stats.messages_sent),
            Cell::new(stats.messages_received),
            Cell::new(stats.active_conversations),
        ]);
    }
    println!("{agents}");
    println!();
}

fn warn_if(count: u64) -> Option<Color> {
    (count > 0).then_some(Color::Yellow)
}
