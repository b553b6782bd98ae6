use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use disk_provisioner::config::default_config_path;
use disk_provisioner::{
    interrupt, AttachmentManager, Config, ImageHandle, MediaWriter, PipelineError, Platform,
    Verifier, VerifyLevel, WriteOptions,
};
use tracing_subscriber::EnvFilter;

const EXIT_ERROR: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_INCONSISTENT: u8 = 3;

#[derive(Debug)]
struct Usage(String);

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\n{}", self.0, usage())
    }
}

impl std::error::Error for Usage {}

fn usage() -> &'static str {
    "Usage:\n  disk-provisioner run [config.toml] [--json]\n  disk-provisioner verify <image> [basic|extended]\n  disk-provisioner inspect <image>\n  disk-provisioner platform\n  disk-provisioner disks\n  disk-provisioner write <image> <device> --yes [--no-eject]"
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("disk_provisioner=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match dispatch(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<Usage>().is_some() {
        return EXIT_USAGE;
    }
    match err.downcast_ref::<PipelineError>() {
        Some(p) if p.is_inconsistent() => EXIT_INCONSISTENT,
        _ => EXIT_ERROR,
    }
}

fn dispatch(args: &[String]) -> Result<()> {
    match args {
        [run] if run == "run" => run_config(None, false),
        [run, json] if run == "run" && json == "--json" => run_config(None, true),
        [run, config] if run == "run" => run_config(Some(Path::new(config)), false),
        [run, config, json] if run == "run" && json == "--json" => {
            run_config(Some(Path::new(config)), true)
        }
        [verify, image] if verify == "verify" => verify_image(Path::new(image), VerifyLevel::Basic),
        [verify, image, level] if verify == "verify" => {
            let level = level.parse::<VerifyLevel>().map_err(Usage)?;
            verify_image(Path::new(image), level)
        }
        [inspect, image] if inspect == "inspect" => inspect_image(Path::new(image)),
        [platform] if platform == "platform" => print_platform(),
        [disks] if disks == "disks" => list_disks(),
        [write, image, device, flags @ ..] if write == "write" => {
            write_media(Path::new(image), Path::new(device), flags)
        }
        _ => Err(Usage("unrecognized arguments".to_string()).into()),
    }
}

fn run_config(path: Option<&Path>, json: bool) -> Result<()> {
    let path: PathBuf = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()
            .ok_or_else(|| Usage("no config path given and no config directory found".into()))?,
    };
    let config = Config::load(&path)?;
    interrupt::install_handlers()?;

    let report = disk_provisioner::run_pipeline(config)?;
    if json {
        println!("{}", report.to_json().context("serializing report")?);
    } else {
        println!(
            "[provision] {} done: {} step(s), {} warning(s)",
            report.image.display(),
            report.steps_run(),
            report.warnings.len()
        );
        for w in &report.warnings {
            println!("  warning: {}", w);
        }
    }
    Ok(())
}

fn verify_image(image: &Path, level: VerifyLevel) -> Result<()> {
    let config = Config::for_image(image);
    let mut verifier = Verifier::new(config.verify.clone());
    if level == VerifyLevel::Extended {
        let strategy = Platform::detect().attach_strategy()?;
        verifier = verifier.with_attacher(&AttachmentManager::new(strategy, config.attach));
    }
    let report = verifier.verify(image, level)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing verification report")?
    );
    Ok(())
}

fn inspect_image(image: &Path) -> Result<()> {
    let handle = ImageHandle::inspect(image)?;
    let table = handle.partition_table()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&table).context("serializing partition table")?
    );
    Ok(())
}

fn print_platform() -> Result<()> {
    let platform = Platform::detect();
    println!(
        "{}",
        serde_json::to_string_pretty(&platform).context("serializing platform")?
    );
    Ok(())
}

fn media_writer(image: Option<&Path>) -> Result<MediaWriter> {
    let platform = Platform::detect();
    platform.check_media_tools()?;
    let verify = match image {
        Some(image) => Config::for_image(image).verify,
        None => Default::default(),
    };
    Ok(MediaWriter::new(
        platform.media_backend()?,
        Verifier::new(verify),
    ))
}

fn list_disks() -> Result<()> {
    let disks = media_writer(None)?.list()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&disks).context("serializing disk list")?
    );
    Ok(())
}

fn write_media(image: &Path, device: &Path, flags: &[String]) -> Result<()> {
    let mut confirmed = false;
    let mut options = WriteOptions::default();
    for flag in flags {
        match flag.as_str() {
            "--yes" => confirmed = true,
            "--no-eject" => options.eject = false,
            other => return Err(Usage(format!("unknown flag '{}'", other)).into()),
        }
    }
    if !confirmed {
        return Err(Usage(format!(
            "writing erases everything on {}; pass --yes to confirm",
            device.display()
        ))
        .into());
    }

    let report = media_writer(Some(image))?.write(image, device, options)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing write report")?
    );
    Ok(())
}
