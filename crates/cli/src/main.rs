use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use metrics::counter;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use vink_api::{KubeTransport, PointLookup, SharedTransport};
use vink_core::summary::{render_age, status_of};
use vink_core::{Combinator, Entity, FieldSelector, FilterOptions, LabelSelector, NamespaceName, ResourceType};
use vink_watch::{subscribe, JoinedVm, Projection, ProjectionHandle, Subscription, WatchConfig};

#[derive(Parser, Debug)]
#[command(name = "vinkctl", version, about = "Vink CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to scope to (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List watchable resource types
    Types {
        /// Only types the cluster actually serves
        #[arg(long = "served", action = ArgAction::SetTrue)]
        served: bool,
    },
    /// Watch a resource type and print +/~/- as the projection changes
    Watch {
        /// Resource type, e.g. "vm", "VirtualMachineInstance", "node"
        resource: ResourceType,
        /// Field selector, e.g. "metadata.name=vm1" or "status.printableStatus~=Running|Stopped"
        #[arg(long = "field")]
        fields: Vec<FieldSelector>,
        /// Join field selectors with OR instead of AND
        #[arg(long = "or", action = ArgAction::SetTrue)]
        or: bool,
        /// Label selector, e.g. "app=db,tier!=cache"
        #[arg(short = 'l', long = "selector")]
        labels: Option<LabelSelector>,
    },
    /// Fetch objects by identity through the point-lookup path
    Get {
        resource: ResourceType,
        /// Identities as namespace/name (bare name for cluster-scoped types)
        #[arg(required = true)]
        ids: Vec<NamespaceName>,
    },
    /// VirtualMachines joined with their instance, node and boot volume
    Vms {
        /// Keep printing the table as it changes
        #[arg(long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("VINK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VINK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VINK_METRICS_ADDR; expected host:port");
        }
    }
}

fn wait_budget() -> Duration {
    Duration::from_secs(std::env::var("VINK_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = WatchConfig::from_env();

    match cli.command {
        Commands::Types { served } => {
            info!(served, "types invoked");
            let types: Vec<ResourceType> = if served {
                let transport = KubeTransport::connect(cfg.stream_buffer).await?;
                let found = vink_kubehub::discover(transport.client()).await.context("discovery failed")?;
                let mut out: Vec<ResourceType> = found.iter().filter_map(|r| r.resource_type()).collect();
                out.sort();
                out.dedup();
                out
            } else {
                ResourceType::ALL.to_vec()
            };
            #[derive(Serialize)]
            struct Row { name: &'static str, gvk: String, namespaced: bool }
            let rows: Vec<Row> = types.iter().map(|rt| Row { name: rt.label(), gvk: rt.gvk_key(), namespaced: rt.namespaced() }).collect();
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.name, r.gvk, scope);
                    }
                }
                other => emit(other, &rows)?,
            }
        }
        Commands::Watch { resource, fields, or, labels } => {
            let mut opts = match cli.namespace.clone() {
                Some(ns) => FilterOptions::in_namespace(ns),
                None => FilterOptions::all(),
            };
            for f in fields { opts = opts.with_field(f); }
            if or { opts = opts.with_combinator(Combinator::Or); }
            if let Some(l) = labels { opts = opts.with_labels(l); }
            info!(resource = %resource, ns = ?opts.namespace, "watch invoked");
            let transport: SharedTransport = Arc::new(KubeTransport::connect(cfg.stream_buffer).await?);
            let sub = subscribe(transport, resource, opts, cfg.without_cascade());
            watch_loop(sub, cli.output).await;
        }
        Commands::Get { resource, ids } => {
            info!(resource = %resource, ids = ids.len(), "get invoked");
            let transport = KubeTransport::connect(cfg.stream_buffer).await?;
            let t0 = Instant::now();
            let items = transport
                .lookup(resource, &ids, Default::default())
                .await
                .with_context(|| format!("lookup of {} failed", resource))?;
            info!(requested = ids.len(), found = items.len(), took_ms = %t0.elapsed().as_millis(), "get done");
            let mut entities = Vec::new();
            for item in &items {
                match Entity::decode(resource, item) {
                    Ok(e) => entities.push(e),
                    Err(e) => warn!(error = %e, "skipping malformed object"),
                }
            }
            match cli.output {
                Output::Human => print_table(&entities),
                other => emit(other, &entities.iter().map(Entity::raw).collect::<Vec<_>>())?,
            }
        }
        Commands::Vms { follow } => {
            let opts = cli.namespace.clone().map(FilterOptions::in_namespace).unwrap_or_else(FilterOptions::all);
            info!(ns = ?opts.namespace, follow, "vms invoked");
            let transport: SharedTransport = Arc::new(KubeTransport::connect(cfg.stream_buffer).await?);
            let mut sub = subscribe(transport, ResourceType::VirtualMachine, opts, cfg);
            settle(&sub).await;
            print_vms(&mut sub, cli.output)?;
            if follow {
                let mut published = sub.projection().subscribe();
                let mut derived: Vec<_> = sub.cascade_targets().filter_map(|t| sub.cascade(t)).map(|h| h.subscribe()).collect();
                loop {
                    tokio::select! {
                        r = published.changed() => {
                            if r.is_err() { break; }
                        }
                        _ = any_changed(&mut derived) => {},
                        _ = signal::ctrl_c() => {
                            info!("Ctrl-C received; shutting down");
                            break;
                        }
                    }
                    // Coalesce bursts before redrawing.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    println!();
                    print_vms(&mut sub, cli.output)?;
                }
            }
            sub.unsubscribe();
        }
    }

    Ok(())
}

/// Resolves when any receiver sees a new publish; pends forever if none can.
async fn any_changed(rxs: &mut [tokio::sync::watch::Receiver<u64>]) {
    if rxs.is_empty() {
        return std::future::pending().await;
    }
    let _ = futures::future::select_all(rxs.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
}

/// Wait for the primary projection and every derived one to finish loading,
/// bounded by `VINK_WAIT_SECS`.
async fn settle(sub: &Subscription) {
    let t0 = Instant::now();
    let mut handles: Vec<ProjectionHandle> = vec![sub.projection()];
    handles.extend(sub.cascade_targets().filter_map(|t| sub.cascade(t)));
    let all = async {
        for h in &handles { h.wait_loaded().await; }
    };
    if tokio::time::timeout(wait_budget(), all).await.is_err() {
        warn!(waited_ms = %t0.elapsed().as_millis(), "views still loading; printing what is there");
    } else {
        info!(took_ms = %t0.elapsed().as_millis(), "views loaded");
    }
}

async fn watch_loop(mut sub: Subscription, output: Output) {
    let handle = sub.projection();
    let mut published = handle.subscribe();
    let mut loading = sub.subscribe_loading();
    let mut prev: Arc<Projection> = handle.current();
    let t0 = Instant::now();
    loop {
        tokio::select! {
            r = loading.changed() => {
                if r.is_err() { break; }
                if *loading.borrow_and_update() {
                    info!("loading snapshot");
                } else {
                    info!(objects = handle.len(), took_ms = %t0.elapsed().as_millis(), "snapshot loaded");
                }
            }
            r = published.changed() => {
                if r.is_err() { break; }
                let next = handle.current();
                print_diff(&prev, &next, output);
                prev = next;
            }
            Some(err) = sub.errors().recv() => {
                error!(resource = err.resource, kind = %err.kind, session = %err.session, "{}", err.message);
                eprintln!("error: {}", err);
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    sub.unsubscribe();
    warn!(sessions = sub.sessions_opened(), "watch loop ended (graceful shutdown)");
}

fn print_diff(prev: &Projection, next: &Projection, output: Output) {
    let mut lines: Vec<(char, &Entity)> = prev.values().filter(|e| !next.contains(e.key().as_str())).map(|e| ('-', e)).collect();
    for e in next.values() {
        match prev.get(e.key().as_str()) {
            None => lines.push(('+', e)),
            Some(old) if old.raw() != e.raw() => lines.push(('~', e)),
            Some(_) => {}
        }
    }
    for (sign, e) in lines {
        counter!("cli_changes_printed_total", 1u64, "change" => sign.to_string());
        match output {
            Output::Human => println!("{} {} {}", sign, e.key(), status_of(e)),
            Output::Json => println!("{}", serde_json::json!({ "change": sign.to_string(), "object": e.raw() })),
            Output::Yaml => {
                let doc = serde_json::json!({ "change": sign.to_string(), "object": e.raw() });
                match serde_yaml::to_string(&doc) {
                    Ok(s) => println!("---\n{}", s.trim_end()),
                    Err(err) => warn!(error = %err, "yaml encode failed"),
                }
            }
        }
    }
}

fn print_table(entities: &[Entity]) {
    let now = chrono::Utc::now().timestamp();
    println!("{:<16} {:<28} {:<18} AGE", "NAMESPACE", "NAME", "STATUS");
    for e in entities {
        let ns = e.metadata().namespace.as_deref().unwrap_or("-");
        println!("{:<16} {:<28} {:<18} {}", ns, e.name(), status_of(e), render_age(e.metadata().creation_ts(), now));
    }
}

#[derive(Serialize)]
struct VmRow {
    namespace: String,
    name: String,
    status: String,
    node: Option<String>,
    ip: Option<String>,
    boot_volume: Option<String>,
    boot_volume_status: Option<String>,
    age: String,
}

impl VmRow {
    fn new(j: &JoinedVm, now: i64) -> Self {
        let meta = j.vm.metadata();
        let ip = j
            .instance
            .as_ref()
            .and_then(|i| i.as_instance())
            .and_then(|i| i.status.interfaces.iter().find_map(|n| n.ip_address.clone()));
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone(),
            status: status_of(&j.vm),
            node: j.node.as_ref().map(|n| n.name().to_string()),
            ip,
            boot_volume: j.boot_volume.as_ref().map(|d| d.name().to_string()),
            boot_volume_status: j.boot_volume.as_ref().map(status_of),
            age: render_age(meta.creation_ts(), now),
        }
    }
}

fn print_vms(sub: &mut Subscription, output: Output) -> Result<()> {
    for err in sub.errors().drain() {
        warn!(resource = err.resource, kind = %err.kind, "{}", err.message);
        eprintln!("error: {}", err);
    }
    let now = chrono::Utc::now().timestamp();
    let snap = sub.projection().current();
    let rows: Vec<VmRow> = snap.keys().filter_map(|k| sub.join_vm(k.as_str())).map(|j| VmRow::new(&j, now)).collect();
    match output {
        Output::Human => {
            println!("{:<14} {:<24} {:<14} {:<14} {:<15} {:<24} AGE", "NAMESPACE", "NAME", "STATUS", "NODE", "IP", "BOOT VOLUME");
            for r in &rows {
                let boot = match (&r.boot_volume, &r.boot_volume_status) {
                    (Some(b), Some(s)) => format!("{} ({})", b, s),
                    _ => "-".to_string(),
                };
                println!(
                    "{:<14} {:<24} {:<14} {:<14} {:<15} {:<24} {}",
                    r.namespace,
                    r.name,
                    r.status,
                    r.node.as_deref().unwrap_or("-"),
                    r.ip.as_deref().unwrap_or("-"),
                    boot,
                    r.age
                );
            }
        }
        other => {
            let by_key: BTreeMap<String, &VmRow> = rows.iter().map(|r| (format!("{}/{}", r.namespace, r.name), r)).collect();
            emit(other, &by_key)?;
        }
    }
    Ok(())
}

fn emit<T: Serialize>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
        Output::Human => {}
    }
    Ok(())
}
