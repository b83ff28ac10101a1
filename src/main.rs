// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use event_monitor::EventMonitor;
use option_parser::CpuList;
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use vmm::builder::{CpuMode, VmSpec};
use vmm::config::HostConfig;
use vmm::disk::{DiskFormat, DiskTool};
use vmm::host_services::HostServices;
use vmm::host_tuning::{HostTuning, HugePagesSpec};
use vmm::isolation::IsolationSelection;
use vmm::lifecycle::{Controller, ResourceEdit};
use vmm::migration::{CancelToken, MigrationRequest, Migrator, SshOptions};
use vmm::notify::{NoopNotifier, Notifier};
use vmm::pinning::{self, PinningRequest, VcpuPin};
use vmm::topology::Topology;

#[derive(Error, Debug)]
enum Error {
    #[error("Error loading host configuration")]
    Config(#[source] vmm::config::Error),
    #[error("Error opening event monitor file {0:?}")]
    EventMonitorFile(PathBuf, #[source] io::Error),
    #[error("Error creating event monitor")]
    EventMonitor(#[source] io::Error),
    #[error("Error spawning event printer thread")]
    EventPrinter(#[source] io::Error),
    #[error("Error installing signal handler")]
    SignalHandler(#[source] io::Error),
    #[error("Error parsing {0}")]
    Parse(&'static str, #[source] vmm::config::Error),
    #[error("Error reading definition from {0:?}")]
    ReadDefinition(PathBuf, #[source] io::Error),
}

fn vm_name_arg() -> Arg {
    Arg::new("name")
        .help("Name of the workload")
        .required(true)
        .num_args(1)
}

fn toggle_arg() -> Arg {
    Arg::new("state")
        .help("Enable or disable the feature")
        .required(true)
        .value_parser(["on", "off"])
}

fn pinning_arg() -> Arg {
    Arg::new("pinning")
        .long("pinning")
        .help(PinningRequest::SYNTAX)
        .num_args(1)
}

fn lifecycle_command(name: &'static str, about: &'static str) -> Command {
    Command::new(name).about(about).arg(vm_name_arg())
}

fn create_app() -> Command {
    Command::new("vmhost")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Manage CPU pinning, isolation, huge pages and migration of hypervisor workloads.")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to a JSON host configuration file")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("uri")
                .long("uri")
                .help("Hypervisor connection URI, overrides the configuration file")
                .num_args(1)
                .global(true),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of debugging output")
                .global(true),
        )
        .arg(
            Arg::new("event-monitor")
                .long("event-monitor")
                .help("File to report events on")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("events")
                .long("events")
                .help("Print events on standard output")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("topology").about("Show the host CPU topology"))
        .subcommand(
            Command::new("pin")
                .about("vCPU pinning of a workload")
                .subcommand_required(true)
                .subcommand(
                    Command::new("preview")
                        .about("Show the pins a request would produce")
                        .arg(pinning_arg().required(true)),
                )
                .subcommand(
                    Command::new("apply")
                        .about("Pin a shut off workload to a core range")
                        .arg(vm_name_arg())
                        .arg(pinning_arg().required(true)),
                )
                .subcommand(lifecycle_command("remove", "Remove the pins of a shut off workload"))
                .subcommand(lifecycle_command("show", "Show the pins of a workload")),
        )
        .subcommand(
            Command::new("isolation")
                .about("Host core isolation")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("Show configured and active isolation"))
                .subcommand(
                    Command::new("set")
                        .about("Isolate physical cores from the next boot on")
                        .arg(
                            Arg::new("cores")
                                .help(IsolationSelection::SYNTAX)
                                .required(true)
                                .num_args(1),
                        ),
                )
                .subcommand(Command::new("remove").about("Remove core isolation")),
        )
        .subcommand(
            Command::new("host-hugepages")
                .about("Host huge page reservation")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("Show configured and active huge pages"))
                .subcommand(
                    Command::new("set")
                        .about("Reserve huge pages from the next boot on")
                        .arg(
                            Arg::new("hugepages")
                                .help(HugePagesSpec::SYNTAX)
                                .required(true)
                                .num_args(1),
                        ),
                )
                .subcommand(Command::new("remove").about("Remove the huge page reservation")),
        )
        .subcommand(
            Command::new("hugepages")
                .about("Huge page backing of a workload")
                .subcommand_required(true)
                .subcommand(lifecycle_command("show", "Show huge page backing"))
                .subcommand(
                    lifecycle_command("set", "Enable or disable huge page backing")
                        .arg(toggle_arg()),
                ),
        )
        .subcommand(
            Command::new("balloon")
                .about("Memory balloon of a workload")
                .subcommand_required(true)
                .subcommand(lifecycle_command("show", "Show the memory balloon"))
                .subcommand(
                    lifecycle_command("set", "Enable or disable the memory balloon")
                        .arg(toggle_arg()),
                ),
        )
        .subcommand(
            Command::new("vm")
                .about("Workload lifecycle")
                .subcommand_required(true)
                .subcommand(create_vm_command())
                .subcommand(lifecycle_command("start", "Start a shut off workload"))
                .subcommand(lifecycle_command(
                    "shutdown",
                    "Shut a workload down gracefully",
                ))
                .subcommand(lifecycle_command("destroy", "Force a workload off"))
                .subcommand(lifecycle_command("pause", "Pause a running workload"))
                .subcommand(lifecycle_command("resume", "Resume a paused workload"))
                .subcommand(lifecycle_command("restart", "Force off and start again"))
                .subcommand(lifecycle_command(
                    "undefine",
                    "Remove the definition, keeping storage",
                ))
                .subcommand(lifecycle_command(
                    "remove",
                    "Remove the definition and its storage",
                ))
                .subcommand(edit_vm_command())
                .subcommand(lifecycle_command("state", "Show the state of a workload"))
                .subcommand(Command::new("list").about("List every defined workload")),
        )
        .subcommand(
            lifecycle_command("vnc-password", "Change the VNC password of a workload").arg(
                Arg::new("password")
                    .help("New VNC password")
                    .required(true)
                    .num_args(1),
            ),
        )
        .subcommand(
            Command::new("vnc-video")
                .about("Browser console (noVNC) devices of a workload")
                .subcommand_required(true)
                .subcommand(lifecycle_command("show", "Show the console devices"))
                .subcommand(
                    lifecycle_command("set", "Add or remove the VNC server and video adapter")
                        .arg(toggle_arg()),
                ),
        )
        .subcommand(
            Command::new("irqbalance")
                .about("Host interrupt balancing service")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("Show whether irqbalance runs"))
                .subcommand(
                    Command::new("set")
                        .about("Enable and start, or disable and stop, irqbalance")
                        .arg(toggle_arg()),
                ),
        )
        .subcommand(
            Command::new("tuned")
                .about("Host tuned profiles")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("List profiles and the active one"))
                .subcommand(
                    Command::new("set").about("Activate profiles, merged in order").arg(
                        Arg::new("profile")
                            .help("Profile names")
                            .required(true)
                            .num_args(1..),
                    ),
                ),
        )
        .subcommand(
            Command::new("xml")
                .about("Full definition of a workload")
                .subcommand_required(true)
                .subcommand(lifecycle_command("show", "Print the persistent definition"))
                .subcommand(
                    lifecycle_command("replace", "Replace the definition of a shut off workload")
                        .arg(
                            Arg::new("file")
                                .help("Definition file, or - for standard input")
                                .required(true)
                                .num_args(1)
                                .value_parser(value_parser!(PathBuf)),
                        ),
                ),
        )
        .subcommand(migrate_command())
        .subcommand(
            lifecycle_command(
                "cold-migrate",
                "Move a workload definition to another host sharing its storage",
            )
            .arg(
                Arg::new("destination")
                    .help("Destination hypervisor URI")
                    .required(true)
                    .num_args(1),
            ),
        )
}

fn edit_vm_command() -> Command {
    lifecycle_command("edit", "Change the vCPUs, memory or disk size of a shut off workload")
        .arg(
            Arg::new("vcpus")
                .long("vcpus")
                .help("New vCPU count")
                .num_args(1)
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("memory")
                .long("memory")
                .help("New memory size in MiB")
                .num_args(1)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("disk-size")
                .long("disk-size")
                .help("Grow the disk to this size in GiB")
                .num_args(1)
                .value_parser(value_parser!(u64)),
        )
}

fn create_vm_command() -> Command {
    lifecycle_command("create", "Create and start a workload")
        .arg(
            Arg::new("memory")
                .long("memory")
                .help("Guest memory in MiB")
                .required(true)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("vcpus")
                .long("vcpus")
                .help("Number of vCPUs, ignored when --pinning is given")
                .default_value("1")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("disk")
                .long("disk")
                .help("Disk image path, defaults to the storage root")
                .num_args(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("disk-size")
                .long("disk-size")
                .help("Size in GiB of the disk image to create when missing")
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("disk-format")
                .long("disk-format")
                .help("Disk image format, detected when omitted")
                .num_args(1),
        )
        .arg(
            Arg::new("iso")
                .long("iso")
                .help("Installation media, bare names resolve under the storage root")
                .num_args(1),
        )
        .arg(
            Arg::new("network")
                .long("network")
                .help("Hypervisor network to attach to")
                .default_value(vmm::builder::DEFAULT_NETWORK),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("VNC listen address")
                .default_value(vmm::builder::DEFAULT_LISTEN),
        )
        .arg(
            Arg::new("vnc-password")
                .long("vnc-password")
                .help("VNC password")
                .num_args(1),
        )
        .arg(
            Arg::new("cpu")
                .long("cpu")
                .help(CpuMode::SYNTAX)
                .num_args(1),
        )
        .arg(
            Arg::new("machine")
                .long("machine")
                .help("Machine type")
                .default_value(vmm::builder::DEFAULT_MACHINE),
        )
        .arg(pinning_arg())
}

fn migrate_command() -> Command {
    lifecycle_command("migrate", "Migrate a workload to another host")
        .arg(
            Arg::new("destination")
                .help("Destination hypervisor URI")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("offline")
                .long("offline")
                .help("Suspend the workload for the transfer instead of migrating live")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .help("Seconds before the hypervisor gives up, 0 for none")
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("ssh-identity")
                .long("ssh-identity")
                .help("Private key used by the ssh transport")
                .num_args(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("ssh-known-hosts")
                .long("ssh-known-hosts")
                .help("Known hosts file used by the ssh transport")
                .num_args(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("ssh-skip-host-key-check")
                .long("ssh-skip-host-key-check")
                .help("Do not verify the destination host key")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ssh-option")
                .long("ssh-option")
                .help("Extra ssh option, may be repeated")
                .num_args(1)
                .action(ArgAction::Append),
        )
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn name(matches: &ArgMatches) -> &str {
    matches
        .get_one::<String>("name")
        .map(String::as_str)
        .unwrap_or_default()
}

fn enabled(matches: &ArgMatches) -> bool {
    matches.get_one::<String>("state").map(String::as_str) == Some("on")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_pins(pins: &[VcpuPin]) {
    for pin in pins {
        println!("vcpu {}: {}", pin.vcpu, CpuList(pin.cpuset.clone()));
    }
}

fn parse_pinning(matches: &ArgMatches) -> Result<Option<PinningRequest>, Error> {
    matches
        .get_one::<String>("pinning")
        .map(|p| PinningRequest::parse(p).map_err(|e| Error::Parse("pinning", e)))
        .transpose()
}

fn vm_spec_from_args(matches: &ArgMatches) -> Result<VmSpec, Error> {
    let mut spec = VmSpec::new(
        name(matches),
        matches.get_one::<u64>("memory").copied().unwrap_or_default(),
        matches.get_one::<u32>("vcpus").copied().unwrap_or(1),
    );
    spec.disk = matches.get_one::<PathBuf>("disk").cloned();
    spec.disk_size_gib = matches.get_one::<u64>("disk-size").copied().unwrap_or_default();
    spec.disk_format = matches
        .get_one::<String>("disk-format")
        .map(|f| DiskFormat::from(f.as_str()));
    spec.iso = matches.get_one::<String>("iso").cloned();
    if let Some(network) = matches.get_one::<String>("network") {
        spec.network = network.clone();
    }
    if let Some(listen) = matches.get_one::<String>("listen") {
        spec.listen = listen.clone();
    }
    spec.vnc_password = matches.get_one::<String>("vnc-password").cloned();
    if let Some(cpu) = matches.get_one::<String>("cpu") {
        spec.cpu = CpuMode::parse(cpu).map_err(|e| Error::Parse("cpu", e))?;
    }
    if let Some(machine) = matches.get_one::<String>("machine") {
        spec.machine = machine.clone();
    }
    spec.pinning = parse_pinning(matches)?;
    Ok(spec)
}

fn migration_request_from_args(matches: &ArgMatches) -> MigrationRequest {
    let destination = matches
        .get_one::<String>("destination")
        .map(String::as_str)
        .unwrap_or_default();
    let mut request = MigrationRequest::new(name(matches), destination, !matches.get_flag("offline"));
    request.timeout = matches
        .get_one::<u64>("timeout")
        .copied()
        .filter(|t| *t > 0)
        .map(Duration::from_secs);
    request.ssh = SshOptions {
        identity_file: matches.get_one::<PathBuf>("ssh-identity").cloned(),
        skip_host_key_check: matches.get_flag("ssh-skip-host-key-check"),
        known_hosts_file: matches.get_one::<PathBuf>("ssh-known-hosts").cloned(),
        extra: matches
            .get_many::<String>("ssh-option")
            .map(|o| o.cloned().collect())
            .unwrap_or_default(),
    };
    request
}

fn resource_edit_from_args(matches: &ArgMatches) -> ResourceEdit {
    ResourceEdit {
        vcpus: matches.get_one::<u32>("vcpus").copied(),
        memory_mib: matches.get_one::<u64>("memory").copied(),
        disk_size_gib: matches.get_one::<u64>("disk-size").copied(),
    }
}

fn read_definition(path: &Path) -> Result<String, Error> {
    if path == Path::new("-") {
        let mut xml = String::new();
        io::stdin()
            .read_to_string(&mut xml)
            .map_err(|e| Error::ReadDefinition(path.to_path_buf(), e))?;
        Ok(xml)
    } else {
        fs::read_to_string(path).map_err(|e| Error::ReadDefinition(path.to_path_buf(), e))
    }
}

/// Everything a subcommand needs, built once from the global options.
struct Session {
    config: HostConfig,
    notifier: Arc<dyn Notifier>,
}

impl Session {
    fn controller(&self, uri: &str) -> Controller {
        Controller::from_config(self.config.hypervisor(uri), &self.config)
            .with_notifier(self.notifier.clone())
    }

    fn local(&self) -> Controller {
        self.controller(&self.config.uri)
    }

    fn topology(&self) -> vmm::Result<Topology> {
        Topology::discover(&self.config.cpu_sysfs)
    }

    fn host_tuning(&self) -> HostTuning {
        HostTuning::from_config(&self.config).with_notifier(self.notifier.clone())
    }

    fn disk_tool(&self) -> DiskTool {
        DiskTool::new(&self.config.qemu_img, self.config.command_runner())
    }

    fn host_services(&self) -> HostServices {
        HostServices::from_config(&self.config).with_notifier(self.notifier.clone())
    }
}

fn run_pin(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("preview", m)) => {
            let request = parse_pinning(m)?.ok_or_else(|| anyhow!("--pinning is required"))?;
            let topology = ctx.topology()?;
            let pins = pinning::build_vcpu_pins(&request, &topology)?;
            print!("{}", pinning::build_cputune_description(&pins));
        }
        Some(("apply", m)) => {
            let request = parse_pinning(m)?.ok_or_else(|| anyhow!("--pinning is required"))?;
            let topology = ctx.topology()?;
            let pins = ctx.local().apply_cpu_pinning(name(m), &request, &topology)?;
            print_pins(&pins);
        }
        Some(("remove", m)) => ctx.local().remove_cpu_pinning(name(m))?,
        Some(("show", m)) => {
            let topology = ctx.topology()?;
            print_json(&ctx.local().get_cpu_pinning(name(m), &topology)?)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn run_isolation(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let topology = ctx.topology()?;
    let tuning = ctx.host_tuning();
    let state = match matches.subcommand() {
        Some(("show", _)) => tuning.get_core_isolation(&topology)?,
        Some(("set", m)) => {
            let cores = m
                .get_one::<String>("cores")
                .map(String::as_str)
                .unwrap_or_default();
            let selections =
                IsolationSelection::parse_list(cores).map_err(|e| Error::Parse("isolation", e))?;
            tuning.set_core_isolation(&selections, &topology)?
        }
        Some(("remove", _)) => tuning.remove_core_isolation(&topology)?,
        _ => unreachable!(),
    };
    print_json(&state)
}

fn run_host_hugepages(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let tuning = ctx.host_tuning();
    let state = match matches.subcommand() {
        Some(("show", _)) => tuning.get_hugepages()?,
        Some(("set", m)) => {
            let hugepages = m
                .get_one::<String>("hugepages")
                .map(String::as_str)
                .unwrap_or_default();
            let spec = HugePagesSpec::parse(hugepages).map_err(|e| Error::Parse("hugepages", e))?;
            tuning.set_hugepages(&spec)?
        }
        Some(("remove", _)) => tuning.remove_hugepages()?,
        _ => unreachable!(),
    };
    print_json(&state)
}

fn run_hugepages(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let controller = ctx.local();
    match matches.subcommand() {
        Some(("show", m)) => print_json(&controller.hugepages(name(m))?),
        Some(("set", m)) => print_json(&controller.set_hugepages(name(m), enabled(m))?),
        _ => unreachable!(),
    }
}

fn run_balloon(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let controller = ctx.local();
    match matches.subcommand() {
        Some(("show", m)) => print_json(&controller.memory_balloon(name(m))?),
        Some(("set", m)) => print_json(&controller.set_memory_balloon(name(m), enabled(m))?),
        _ => unreachable!(),
    }
}

fn run_vm(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let controller = ctx.local();
    let Some((command, m)) = matches.subcommand() else {
        unreachable!()
    };
    let name = name(m);

    match command {
        "create" => {
            let spec = vm_spec_from_args(m)?;
            let topology = if spec.pinning.is_some() {
                Some(ctx.topology()?)
            } else {
                None
            };
            controller.create(&spec, &ctx.disk_tool(), topology.as_ref())?;
        }
        "edit" => {
            let report = controller.edit_resources(name, &resource_edit_from_args(m), &ctx.disk_tool())?;
            return print_json(&report);
        }
        "start" => controller.start(name)?,
        "shutdown" => controller.shutdown(name)?,
        "destroy" => controller.destroy(name)?,
        "pause" => controller.pause(name)?,
        "resume" => controller.resume(name)?,
        "restart" => controller.restart(name)?,
        "undefine" => {
            controller.undefine(name)?;
            return Ok(());
        }
        "remove" => {
            controller.remove(name)?;
            return Ok(());
        }
        "state" => {}
        "list" => {
            for (name, state) in controller.list()? {
                println!("{name}\t{state}");
            }
            return Ok(());
        }
        _ => unreachable!(),
    }

    println!("{name}: {}", controller.state(name)?);
    Ok(())
}

fn run_vnc_video(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let controller = ctx.local();
    match matches.subcommand() {
        Some(("show", m)) => print_json(&controller.vnc_video(name(m))?),
        Some(("set", m)) => print_json(&controller.set_vnc_video(name(m), enabled(m))?),
        _ => unreachable!(),
    }
}

fn run_irqbalance(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let services = ctx.host_services();
    match matches.subcommand() {
        Some(("show", _)) => print_json(&services.irqbalance()?),
        Some(("set", m)) => print_json(&services.set_irqbalance(enabled(m))?),
        _ => unreachable!(),
    }
}

fn run_tuned(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let services = ctx.host_services();
    match matches.subcommand() {
        Some(("list", _)) => print_json(&services.tuned_profiles()?),
        Some(("set", m)) => {
            let profiles: Vec<&str> = m
                .get_many::<String>("profile")
                .map(|p| p.map(String::as_str).collect())
                .unwrap_or_default();
            print_json(&services.set_tuned_profile(&profiles)?)
        }
        _ => unreachable!(),
    }
}

fn run_xml(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let controller = ctx.local();
    match matches.subcommand() {
        Some(("show", m)) => print!("{}", controller.get_xml(name(m))?),
        Some(("replace", m)) => {
            let path = m
                .get_one::<PathBuf>("file")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("-"));
            let xml = read_definition(&path)?;
            controller.update_xml(name(m), &xml)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Cancel `token` on the first SIGINT or SIGTERM until the returned guard is closed.
fn cancel_on_signal(token: CancelToken) -> Result<(signal_hook::iterator::Handle, JoinHandle<()>), Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(Error::SignalHandler)?;
    let handle = signals.handle();
    let thread = thread::Builder::new()
        .name("vmhost_signal_handler".to_owned())
        .spawn(move || {
            for signal in signals.forever() {
                warn!("Received signal {signal}, cancelling migration");
                token.cancel();
            }
        })
        .map_err(Error::SignalHandler)?;
    Ok((handle, thread))
}

fn run_migrate(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let request = migration_request_from_args(matches);
    let migrator = Migrator::from_config(
        ctx.config.hypervisor(&ctx.config.uri),
        ctx.notifier.clone(),
        &ctx.config,
    );

    let cancel = CancelToken::new();
    let (signals, thread) = cancel_on_signal(cancel.clone())?;
    let result = migrator.migrate(&request, &cancel);
    signals.close();
    if thread.join().is_err() {
        error!("Signal handler thread panicked");
    }

    result.with_context(|| format!("Error migrating {} to {}", request.vm, request.dest_uri))?;
    println!("{}: migrated to {}", request.vm, request.dest_uri);
    Ok(())
}

fn run_cold_migrate(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    let name = name(matches);
    let destination = matches
        .get_one::<String>("destination")
        .map(String::as_str)
        .unwrap_or_default();
    let migrator = Migrator::from_config(
        ctx.config.hypervisor(&ctx.config.uri),
        ctx.notifier.clone(),
        &ctx.config,
    );
    migrator
        .cold_migrate(name, &ctx.controller(destination), &ctx.disk_tool())
        .with_context(|| format!("Error cold migrating {name} to {destination}"))?;
    println!("{name}: moved to {destination}");
    Ok(())
}

fn run(ctx: &Session, matches: &ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("topology", _)) => print_json(&ctx.topology()?),
        Some(("pin", m)) => run_pin(ctx, m),
        Some(("isolation", m)) => run_isolation(ctx, m),
        Some(("host-hugepages", m)) => run_host_hugepages(ctx, m),
        Some(("hugepages", m)) => run_hugepages(ctx, m),
        Some(("balloon", m)) => run_balloon(ctx, m),
        Some(("vm", m)) => run_vm(ctx, m),
        Some(("vnc-password", m)) => {
            let password = m
                .get_one::<String>("password")
                .map(String::as_str)
                .unwrap_or_default();
            Ok(ctx.local().change_vnc_password(name(m), password)?)
        }
        Some(("vnc-video", m)) => run_vnc_video(ctx, m),
        Some(("irqbalance", m)) => run_irqbalance(ctx, m),
        Some(("tuned", m)) => run_tuned(ctx, m),
        Some(("xml", m)) => run_xml(ctx, m),
        Some(("migrate", m)) => run_migrate(ctx, m),
        Some(("cold-migrate", m)) => run_cold_migrate(ctx, m),
        _ => unreachable!(),
    }
}

/// Event producer plus the threads draining it.
struct Events {
    monitor: EventMonitor,
    threads: Vec<JoinHandle<()>>,
}

impl Events {
    fn start(file: Option<&PathBuf>, print: bool) -> Result<Option<Self>, Error> {
        if file.is_none() && !print {
            return Ok(None);
        }

        let file = file
            .map(|path| {
                File::options()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| Error::EventMonitorFile(path.clone(), e))
            })
            .transpose()?;
        let (monitor, mut consumer) = event_monitor::set_monitor(file).map_err(Error::EventMonitor)?;

        let mut threads = Vec::new();
        if print {
            let events = consumer.subscribe();
            threads.push(
                thread::Builder::new()
                    .name("vmhost_event_printer".to_owned())
                    .spawn(move || {
                        while let Ok(event) = events.recv() {
                            println!("{event}");
                        }
                    })
                    .map_err(Error::EventPrinter)?,
            );
        }
        threads.push(consumer.spawn().map_err(Error::EventMonitor)?);

        Ok(Some(Events { monitor, threads }))
    }

    /// Wait for every queued event to be written out.
    fn finish(self) {
        drop(self.monitor);
        for thread in self.threads {
            if thread.join().is_err() {
                error!("Event thread panicked");
            }
        }
    }
}

fn start(matches: &ArgMatches) -> anyhow::Result<()> {
    let mut config = HostConfig::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
        .map_err(Error::Config)?;
    if let Some(uri) = matches.get_one::<String>("uri") {
        config.uri = uri.clone();
    }
    debug!("Using hypervisor at {}", config.uri);

    let events = Events::start(
        matches.get_one::<PathBuf>("event-monitor"),
        matches.get_flag("events"),
    )?;
    let notifier: Arc<dyn Notifier> = match &events {
        Some(events) => Arc::new(events.monitor.clone()),
        None => Arc::new(NoopNotifier),
    };

    let ctx = Session { config, notifier };
    let result = run(&ctx, matches);
    drop(ctx);

    if let Some(events) = events {
        events.finish();
    }
    result
}

fn main() {
    let matches = create_app().get_matches();
    init_logger(matches.get_count("v"));

    let exit_code = match start(&matches) {
        Ok(()) => 0,
        Err(top_error) => {
            eprintln!("Error: {top_error}");
            for cause in top_error.chain().skip(1) {
                eprintln!("  Caused by: {cause}");
            }
            1
        }
    };

    process::exit(exit_code);
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn matches(args: &[&str]) -> ArgMatches {
        create_app()
            .try_get_matches_from(args)
            .unwrap_or_else(|e| panic!("{args:?}: {e}"))
    }

    fn subcommand<'a>(matches: &'a ArgMatches, path: &[&str]) -> &'a ArgMatches {
        path.iter().fold(matches, |m, name| {
            m.subcommand_matches(name)
                .unwrap_or_else(|| panic!("missing subcommand {name}"))
        })
    }

    #[test]
    fn test_app_is_consistent() {
        create_app().debug_assert();
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let m = matches(&["vmhost", "vm", "list", "--uri", "qemu+ssh://node2/system", "-vv"]);
        assert_eq!(m.get_one::<String>("uri").unwrap(), "qemu+ssh://node2/system");
        assert_eq!(m.get_count("v"), 2);
        assert!(!m.get_flag("events"));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(create_app().try_get_matches_from(["vmhost", "pin"]).is_err());
        assert!(create_app()
            .try_get_matches_from(["vmhost", "vm", "start"])
            .is_err());
        assert!(create_app()
            .try_get_matches_from(["vmhost", "hugepages", "set", "web", "maybe"])
            .is_err());
    }

    #[test]
    fn test_vm_spec_from_args() {
        let m = matches(&[
            "vmhost",
            "vm",
            "create",
            "web",
            "--memory",
            "4096",
            "--vcpus",
            "2",
            "--disk-size",
            "20",
            "--disk-format",
            "raw",
            "--iso",
            "debian.iso",
            "--vnc-password",
            "secret1",
            "--cpu",
            "mode=custom,model=Haswell,disable=[vmx]",
            "--pinning",
            "socket=0,start=1,end=2,ht=on",
        ]);
        let spec = vm_spec_from_args(subcommand(&m, &["vm", "create"])).unwrap();

        assert_eq!(spec.name, "web");
        assert_eq!(spec.memory_mib, 4096);
        assert_eq!(spec.vcpus, 2);
        assert_eq!(spec.disk, None);
        assert_eq!(spec.disk_size_gib, 20);
        assert_eq!(spec.disk_format, Some(DiskFormat::Raw));
        assert_eq!(spec.iso.as_deref(), Some("debian.iso"));
        assert_eq!(spec.network, vmm::builder::DEFAULT_NETWORK);
        assert_eq!(spec.listen, vmm::builder::DEFAULT_LISTEN);
        assert_eq!(spec.vnc_password.as_deref(), Some("secret1"));
        assert_eq!(
            spec.cpu,
            CpuMode::Custom {
                model: Some("Haswell".to_owned()),
                disabled: vec!["vmx".to_owned()],
            }
        );
        assert_eq!(
            spec.pinning,
            Some(PinningRequest {
                socket: 0,
                start: 1,
                end: 2,
                hyperthreading: true,
            })
        );
    }

    #[test]
    fn test_vm_spec_defaults() {
        let m = matches(&["vmhost", "vm", "create", "db", "--memory", "1024"]);
        let spec = vm_spec_from_args(subcommand(&m, &["vm", "create"])).unwrap();
        assert_eq!(spec.vcpus, 1);
        assert_eq!(spec.cpu, CpuMode::HostPassthrough);
        assert_eq!(spec.machine, vmm::builder::DEFAULT_MACHINE);
        assert_eq!(spec.pinning, None);
        assert_eq!(spec.disk_format, None);
    }

    #[test]
    fn test_vm_spec_bad_pinning() {
        let m = matches(&[
            "vmhost", "vm", "create", "db", "--memory", "1024", "--pinning", "socket=0",
        ]);
        assert!(matches!(
            vm_spec_from_args(subcommand(&m, &["vm", "create"])),
            Err(Error::Parse("pinning", _))
        ));
    }

    #[test]
    fn test_migration_request_from_args() {
        let m = matches(&[
            "vmhost",
            "migrate",
            "web",
            "qemu+ssh://node2/system",
            "--offline",
            "--timeout",
            "300",
            "--ssh-identity",
            "/root/.ssh/id_ed25519",
            "--ssh-skip-host-key-check",
            "--ssh-option",
            "-o ConnectTimeout=5",
            "--ssh-option",
            "-p 2222",
        ]);
        let request = migration_request_from_args(subcommand(&m, &["migrate"]));

        assert_eq!(request.vm, "web");
        assert_eq!(request.dest_uri, "qemu+ssh://node2/system");
        assert!(!request.live);
        assert_eq!(request.timeout, Some(Duration::from_secs(300)));
        assert_eq!(
            request.ssh.identity_file,
            Some(PathBuf::from("/root/.ssh/id_ed25519"))
        );
        assert!(request.ssh.skip_host_key_check);
        assert_eq!(request.ssh.known_hosts_file, None);
        assert_eq!(request.ssh.extra, vec!["-o ConnectTimeout=5", "-p 2222"]);
    }

    #[test]
    fn test_migration_defaults_to_live() {
        let m = matches(&["vmhost", "migrate", "web", "qemu+ssh://node2/system"]);
        let request = migration_request_from_args(subcommand(&m, &["migrate"]));
        assert!(request.live);
        assert_eq!(request.timeout, None);
        assert_eq!(request.ssh, SshOptions::default());
    }

    #[test]
    fn test_toggle() {
        let m = matches(&["vmhost", "balloon", "set", "web", "off"]);
        assert!(!enabled(subcommand(&m, &["balloon", "set"])));
        let m = matches(&["vmhost", "hugepages", "set", "web", "on"]);
        assert!(enabled(subcommand(&m, &["hugepages", "set"])));
    }

    #[test]
    fn test_resource_edit_from_args() {
        let m = matches(&["vmhost", "vm", "edit", "web", "--vcpus", "8", "--disk-size", "40"]);
        let edit = resource_edit_from_args(subcommand(&m, &["vm", "edit"]));
        assert_eq!(
            edit,
            ResourceEdit {
                vcpus: Some(8),
                memory_mib: None,
                disk_size_gib: Some(40),
            }
        );

        let m = matches(&["vmhost", "vm", "edit", "web"]);
        assert_eq!(
            resource_edit_from_args(subcommand(&m, &["vm", "edit"])),
            ResourceEdit::default()
        );
        assert!(create_app()
            .try_get_matches_from(["vmhost", "vm", "edit", "web", "--memory", "lots"])
            .is_err());
    }

    #[test]
    fn test_host_service_commands() {
        let m = matches(&["vmhost", "tuned", "set", "virtual-host", "latency-performance"]);
        let profiles: Vec<&String> = subcommand(&m, &["tuned", "set"])
            .get_many::<String>("profile")
            .unwrap()
            .collect();
        assert_eq!(profiles, ["virtual-host", "latency-performance"]);

        let m = matches(&["vmhost", "irqbalance", "set", "off"]);
        assert!(!enabled(subcommand(&m, &["irqbalance", "set"])));
        let m = matches(&["vmhost", "vnc-video", "set", "web", "on"]);
        assert!(enabled(subcommand(&m, &["vnc-video", "set"])));
        assert!(create_app()
            .try_get_matches_from(["vmhost", "tuned", "set"])
            .is_err());
    }

    #[test]
    fn test_read_definition_file() {
        let tmp = vmm_sys_util::tempfile::TempFile::new().unwrap();
        fs::write(tmp.as_path(), "<domain><name>web</name></domain>").unwrap();
        assert_eq!(
            read_definition(tmp.as_path()).unwrap(),
            "<domain><name>web</name></domain>"
        );
        assert!(matches!(
            read_definition(Path::new("/nonexistent/web.xml")),
            Err(Error::ReadDefinition(..))
        ));
    }
}
