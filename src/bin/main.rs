//! pve-cri CLI

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pve_cri::container::Mount;
use pve_cri::{
    ContainerConfig, ContainerFilter, ContainerState, ContainerStatus, Error, Orchestrator, Resources, Result,
    RuntimeConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pve-cri")]
#[command(about = "Container runtime orchestrator for LXC, Proxmox guests and crun", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the runtime config (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the state directory from the config
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a container
    Create {
        /// Pod the container belongs to
        #[arg(short, long)]
        pod: String,
        /// Container name, unique within the pod
        #[arg(short, long)]
        name: String,
        /// Template, image, clone source or rootfs path
        #[arg(short, long, default_value = "")]
        image: String,
        #[arg(long)]
        hostname: Option<String>,
        /// Memory limit in MB
        #[arg(short, long)]
        memory: Option<u64>,
        #[arg(long)]
        cpu_shares: Option<u64>,
        /// Whole CPUs, translated to a CFS quota
        #[arg(long)]
        cpus: Option<u32>,
        /// KEY=VALUE
        #[arg(short, long, value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// KEY=VALUE
        #[arg(short, long, value_parser = parse_key_val)]
        label: Vec<(String, String)>,
        /// KEY=VALUE, matched by routing rules
        #[arg(long, value_parser = parse_key_val)]
        namespace: Vec<(String, String)>,
        /// HOST:CONTAINER[:ro]
        #[arg(short = 'v', long = "mount", value_parser = parse_mount)]
        mounts: Vec<Mount>,
        /// Attach to this bridge
        #[arg(long)]
        bridge: Option<String>,
        /// CIDR address or dhcp
        #[arg(long, requires = "bridge")]
        ip: Option<String>,
        /// Entrypoint and arguments
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Start a container
    Start { id: String },
    /// Stop a container
    Stop {
        id: String,
        /// Seconds allowed for a clean shutdown
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Stop if needed, then delete a container
    Rm { id: String },
    /// List containers
    Ps {
        /// Only containers whose id starts with this
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        state: Option<ContainerState>,
        /// KEY=VALUE
        #[arg(short, long, value_parser = parse_key_val)]
        label: Vec<(String, String)>,
    },
    /// Show one container in detail
    Inspect { id: String },
    /// Change resource limits
    Update {
        id: String,
        /// Memory limit in MB
        #[arg(short, long)]
        memory: Option<u64>,
        #[arg(long)]
        cpu_shares: Option<u64>,
        #[arg(long, allow_hyphen_values = true)]
        cpu_quota: Option<i64>,
        #[arg(long)]
        cpu_period: Option<u64>,
    },
    /// Run a command in a running container
    Exec {
        id: String,
        /// Seconds before the command is killed
        #[arg(short, long, default_value = "30")]
        timeout: u64,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Freeze a running container
    Pause { id: String },
    /// Thaw a paused container
    Resume { id: String },
    /// Show which backend a container id would be routed to
    Route {
        id: String,
        /// KEY=VALUE
        #[arg(long, value_parser = parse_key_val)]
        namespace: Vec<(String, String)>,
    },
    /// Show the VMID mapping of one container, or all of them
    Vmid { id: Option<String> },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_mount(s: &str) -> std::result::Result<Mount, String> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [host, container] => Ok(Mount::new(*host, *container)),
        [host, container, "ro"] => Ok(Mount::new(*host, *container).read_only()),
        [_, _, "rw"] => Ok(Mount::new(parts[0], parts[1])),
        _ => Err(format!("expected HOST:CONTAINER[:ro], got '{}'", s)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let mut config = match cli.config {
        Some(ref path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = cli.state_dir.clone() {
        config = config.state_dir(dir);
    }

    let orch = Orchestrator::with_config(config)?;
    let json = cli.json;

    match cli.command {
        Commands::Create {
            pod,
            name,
            image,
            hostname,
            memory,
            cpu_shares,
            cpus,
            env,
            label,
            namespace,
            mounts,
            bridge,
            ip,
            command,
        } => {
            let mut builder = ContainerConfig::builder().name(name).image(image).command(command);
            if let Some(hostname) = hostname {
                builder = builder.hostname(hostname);
            }
            if let Some(mb) = memory {
                builder = builder.memory_bytes(mb * 1024 * 1024);
            }
            if let Some(shares) = cpu_shares {
                builder = builder.cpu_shares(shares);
            }
            if let Some(cpus) = cpus {
                builder = builder.cpu_quota(i64::from(cpus) * 100_000, 100_000);
            }
            for (k, v) in env {
                builder = builder.env(k, v);
            }
            for (k, v) in label {
                builder = builder.label(k, v);
            }
            for (k, v) in namespace {
                builder = builder.namespace(k, v);
            }
            for m in mounts {
                builder = builder.mount(m.host_path, m.container_path, m.read_only);
            }
            if let Some(bridge) = bridge {
                builder = builder.network(bridge, ip);
            }

            let id = orch.create_container(&pod, builder.build_validated()?)?;
            let identity = orch.resolve(&id)?;
            if json {
                print_json(&identity)?;
            } else {
                println!("Created {} (vmid {}, backend {})", id, identity.vmid, identity.backend_kind);
            }
        }
        Commands::Start { id } => {
            orch.start_container(&id)?;
            println!("Started {}", id);
        }
        Commands::Stop { id, timeout } => {
            orch.stop_container(&id, timeout.map(Duration::from_secs))?;
            println!("Stopped {}", id);
        }
        Commands::Rm { id } => {
            orch.remove_container(&id)?;
            println!("Removed {}", id);
        }
        Commands::Ps { prefix, state, label } => {
            let mut filter = ContainerFilter::new();
            filter.id_prefix = prefix;
            filter.state = state;
            filter.labels = label.into_iter().collect();

            let containers = orch.list_containers(Some(&filter))?;
            if json {
                print_json(&containers)?;
            } else {
                print_table(&containers);
            }
        }
        Commands::Inspect { id } => {
            let status = orch.container_status(&id)?;
            if json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
        }
        Commands::Update {
            id,
            memory,
            cpu_shares,
            cpu_quota,
            cpu_period,
        } => {
            let resources = Resources {
                memory_limit_bytes: memory.map(|mb| mb * 1024 * 1024),
                cpu_shares,
                cpu_quota,
                cpu_period,
            };
            orch.update_container_resources(&id, &resources)?;
            println!("Updated {}", id);
        }
        Commands::Exec { id, timeout, command } => {
            let result = orch.exec_sync(&id, &command, Duration::from_secs(timeout))?;
            if json {
                print_json(&result)?;
            } else {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
            }
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
        }
        Commands::Pause { id } => {
            orch.pause_container(&id)?;
            println!("Paused {}", id);
        }
        Commands::Resume { id } => {
            orch.resume_container(&id)?;
            println!("Resumed {}", id);
        }
        Commands::Route { id, namespace } => {
            let namespaces: BTreeMap<String, String> = namespace.into_iter().collect();
            let backend = orch.route(&id, &namespaces)?;
            println!("{} -> {}", id, backend);
        }
        Commands::Vmid { id } => {
            let identities = match id {
                Some(id) => vec![orch.resolve(&id)?],
                None => orch.identity().identities()?,
            };
            if json {
                print_json(&identities)?;
            } else {
                println!("{:<40} {:<8} {:<8}", "CONTAINER", "VMID", "BACKEND");
                println!("{}", "-".repeat(58));
                for identity in identities {
                    println!("{:<40} {:<8} {:<8}", identity.external_id, identity.vmid, identity.backend_kind);
                }
            }
        }
    }

    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pve_cri=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).map_err(Error::from)?);
    Ok(())
}

fn print_table(containers: &[ContainerStatus]) {
    if containers.is_empty() {
        println!("No containers found.");
        return;
    }
    println!(
        "{:<32} {:<8} {:<8} {:<9} {:<16} {:<20}",
        "ID", "VMID", "BACKEND", "STATE", "IP", "CREATED"
    );
    println!("{}", "-".repeat(96));
    for c in containers {
        println!(
            "{:<32} {:<8} {:<8} {:<9} {:<16} {:<20}",
            &c.id[..std::cmp::min(31, c.id.len())],
            c.vmid,
            c.backend,
            c.state,
            c.ip_address.as_deref().unwrap_or("-"),
            c.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_status(s: &ContainerStatus) {
    println!("Container: {}", s.id);
    println!("  VMID:     {}", s.vmid);
    println!("  Backend:  {}", s.backend);
    println!("  State:    {}", s.state);
    println!("  Image:    {}", if s.image.is_empty() { "-" } else { s.image.as_str() });
    println!("  Memory:   {} MB", s.native.memory_mb);
    println!("  Shares:   {}", s.native.cpu_shares);
    if let Some(cores) = s.native.cores {
        println!("  Cores:    {}", cores);
    }
    if let Some(pid) = s.pid {
        println!("  PID:      {}", pid);
    }
    if let Some(ref ip) = s.ip_address {
        println!("  IP:       {}", ip);
    }
    if let Some(used) = s.memory_used_mb {
        println!("  Used:     {} MB", used);
    }
    if let Some(ref started) = s.started_at {
        println!("  Started:  {}", started.to_rfc3339());
    }
    if let Some(ref finished) = s.finished_at {
        println!("  Finished: {}", finished.to_rfc3339());
    }
    if let Some(code) = s.exit_code {
        println!("  Exit:     {}", code);
    }
    if let Some(ref pending) = s.pending_resources {
        println!("  Pending:  {:?}", pending);
    }
    for (k, v) in &s.labels {
        println!("  Label:    {}={}", k, v);
    }
}
