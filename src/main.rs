use anyhow::Result;
use clap::{ArgAction, ArgGroup, Args, Parser, Subcommand, ValueEnum};
use gpu_configurator::backend::new_backend;
use gpu_configurator::config::{Config, CONFIG_PATH_ENV};
use gpu_configurator::mutator::{self, Action, Outcome, NVIDIA_GBM_LIBRARY};
use gpu_configurator::pci::PciDevices;
use gpu_configurator::summary::{hostname, write_summary};
use gpu_configurator::Analyzer;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// A GPU configurator helper for Xwayland and/or Xorg.
#[derive(Parser)]
#[command(name = "gpu-configurator", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Distribution layout (macaroni, funtoo)
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Operate on the system image mounted at this directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show system configuration
    Show {
        #[arg(short, long, value_enum, default_value_t = ShowFormat::Terminal)]
        output: ShowFormat,
    },
    /// Show PCI devices
    Lspci {
        #[arg(short, long, value_enum, default_value_t = DataFormat::Yaml)]
        output: DataFormat,
    },
    /// Show the effective configuration
    Config {
        #[arg(long)]
        json: bool,
    },
    /// Enable/Disable EGL JSON configurations
    Egl(EglArgs),
    /// Manage Vulkan configuration files
    Vulkan {
        #[command(subcommand)]
        command: VulkanCommands,
    },
    /// Manage NVIDIA drivers
    Nvidia {
        #[command(subcommand)]
        command: NvidiaCommands,
    },
}

#[derive(Subcommand)]
enum VulkanCommands {
    /// Enable/Disable Vulkan ICD files
    Icd(IcdArgs),
    /// Enable/Disable Vulkan layer files
    Layers(LayersArgs),
}

#[derive(Subcommand)]
enum NvidiaCommands {
    /// GBM backend library configuration
    Gbmlib(GbmArgs),
    /// Configure a specific version of the NVIDIA driver
    #[command(visible_aliases = ["c", "conf", "set"])]
    Configure { version: String },
    /// Remove the setup of the active NVIDIA driver
    Purge,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShowFormat {
    Terminal,
    Json,
    Yaml,
}

#[derive(Clone, Copy, ValueEnum)]
enum DataFormat {
    Json,
    Yaml,
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["enable_json_loader", "disable_json_loader"])))]
struct EglArgs {
    /// EGL loader file, e.g. 10_nvidia_wayland.json
    file: String,
    #[arg(long, conflicts_with = "disable_json_loader")]
    enable_json_loader: bool,
    #[arg(long)]
    disable_json_loader: bool,
    /// Remove the file instead of disabling it
    #[arg(long, requires = "disable_json_loader", conflicts_with = "enable_json_loader")]
    purge: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["enable_icd_file", "disable_icd_file"])))]
struct IcdArgs {
    /// Vulkan ICD file, e.g. nvidia_icd.json
    file: String,
    #[arg(long, conflicts_with = "disable_icd_file")]
    enable_icd_file: bool,
    #[arg(long)]
    disable_icd_file: bool,
    /// Remove the file instead of disabling it
    #[arg(long, requires = "disable_icd_file", conflicts_with = "enable_icd_file")]
    purge: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["enable_layers_file", "disable_layers_file"])))]
struct LayersArgs {
    /// Vulkan layer file, e.g. nvidia_layers.json
    file: String,
    #[arg(long, conflicts_with = "disable_layers_file")]
    enable_layers_file: bool,
    #[arg(long)]
    disable_layers_file: bool,
    /// Remove the file instead of disabling it
    #[arg(long, requires = "disable_layers_file", conflicts_with = "enable_layers_file")]
    purge: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["enable_driver", "disable_driver"])))]
struct GbmArgs {
    #[arg(long, conflicts_with = "disable_driver")]
    enable_driver: bool,
    #[arg(long)]
    disable_driver: bool,
    /// Remove the library link instead of disabling it
    #[arg(long, requires = "disable_driver", conflicts_with = "enable_driver")]
    purge: bool,
}

fn action(enable: bool, purge: bool) -> Action {
    if enable {
        Action::Enable
    } else if purge {
        Action::Purge
    } else {
        Action::Disable
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
    let mut config = Config::load_or_default(path.as_deref())?;
    config.apply_env()?;

    if cli.debug {
        config.general.debug = true;
    }
    if let Some(backend) = &cli.backend {
        config.general.backend = backend.clone();
    }
    if let Some(root) = &cli.root {
        config.general.root = root.clone();
    }
    Ok(config)
}

fn init_tracing(config: &Config, verbose: u8) {
    let level = match verbose {
        0 if config.general.debug => "debug",
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(config.logging.color)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    init_tracing(&config, cli.verbose);
    debug!(backend = %config.general.backend, root = %config.general.root.display(), "configuration loaded");

    let analyzer = || -> Result<Analyzer> {
        let backend = new_backend(&config.general.backend, config.general.root.clone())?;
        Ok(Analyzer::new(backend))
    };

    match cli.command {
        Commands::Show { output } => {
            let system = analyzer()?.read()?;
            match output {
                ShowFormat::Terminal => {
                    let devices = PciDevices::detect()?;
                    let mut out = io::stdout().lock();
                    write_summary(&mut out, &system, &devices.vga_devices(), &hostname())?;
                    out.flush()?;
                }
                ShowFormat::Json => println!("{}", system.to_json()?),
                ShowFormat::Yaml => print!("{}", system.to_yaml()?),
            }
        }
        Commands::Lspci { output } => {
            let devices = PciDevices::detect()?;
            match output {
                DataFormat::Json => println!("{}", devices.to_json()?),
                DataFormat::Yaml => print!("{}", devices.to_yaml()?),
            }
        }
        Commands::Config { json } => {
            if json {
                println!("{}", config.to_json()?);
            } else {
                print!("{}", config.to_yaml()?);
            }
        }
        Commands::Egl(args) => {
            let system = analyzer()?.read()?;
            let act = action(args.enable_json_loader, args.purge);
            report(&args.file, mutator::egl_loader(&system, &args.file, act)?);
        }
        Commands::Vulkan { command } => {
            let system = analyzer()?.read()?;
            match command {
                VulkanCommands::Icd(args) => {
                    let act = action(args.enable_icd_file, args.purge);
                    report(&args.file, mutator::vulkan_icd_file(&system, &args.file, act)?);
                }
                VulkanCommands::Layers(args) => {
                    let act = action(args.enable_layers_file, args.purge);
                    report(
                        &args.file,
                        mutator::vulkan_layers_file(&system, &args.file, act)?,
                    );
                }
            }
        }
        Commands::Nvidia { command } => {
            let analyzer = analyzer()?;
            let system = analyzer.read()?;
            let backend = analyzer.backend();
            match command {
                NvidiaCommands::Gbmlib(args) => {
                    let Some(gbm_dir) = backend.gbm_lib_dir() else {
                        anyhow::bail!("{} backend has no GBM library directory", backend.name());
                    };
                    let act = action(args.enable_driver, args.purge);
                    report(
                        NVIDIA_GBM_LIBRARY,
                        mutator::nvidia_gbm_library(&system, &gbm_dir, act)?,
                    );
                }
                NvidiaCommands::Configure { version } => {
                    backend.set_nvidia_version(&system.nvidia, &version)?;
                    println!("NVIDIA driver {version} configured.");
                    println!("Run env-update and ldconfig to refresh the environment.");
                }
                NvidiaCommands::Purge => {
                    backend.purge_nvidia_driver(&system.nvidia)?;
                    println!("NVIDIA driver setup removed.");
                }
            }
        }
    }

    Ok(())
}

fn report(name: &str, outcome: Outcome) {
    if outcome.changed() {
        println!("{name}: {outcome}. Operation done.");
    } else {
        println!("{name}: {outcome}.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn enable_and_disable_are_exclusive() {
        let res = Cli::try_parse_from([
            "gpu-configurator",
            "egl",
            "10_nvidia_wayland.json",
            "--enable-json-loader",
            "--disable-json-loader",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn purge_requires_disable() {
        for args in [
            &["egl", "10_nvidia_wayland.json", "--enable-json-loader", "--purge"][..],
            &["vulkan", "icd", "nvidia_icd.json", "--enable-icd-file", "--purge"],
            &["vulkan", "layers", "nvidia_layers.json", "--enable-layers-file", "--purge"],
            &["nvidia", "gbmlib", "--enable-driver", "--purge"],
            &["nvidia", "gbmlib", "--purge"],
        ] {
            let argv = std::iter::once("gpu-configurator").chain(args.iter().copied());
            let res = Cli::try_parse_from(argv);
            assert!(res.is_err(), "accepted {args:?}");
        }

        let cli = Cli::try_parse_from([
            "gpu-configurator",
            "nvidia",
            "gbmlib",
            "--disable-driver",
            "--purge",
        ])
        .unwrap();
        match cli.command {
            Commands::Nvidia {
                command: NvidiaCommands::Gbmlib(args),
            } => assert_eq!(action(args.enable_driver, args.purge), Action::Purge),
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "gpu-configurator",
            "show",
            "-o",
            "json",
            "--root",
            "/mnt/image",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/mnt/image")));
        assert_eq!(cli.verbose, 2);
    }
}
