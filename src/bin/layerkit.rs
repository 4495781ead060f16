//! layerkit - image builder and process supervisor CLI
//!
//! ## Usage
//!
//! ```sh
//! layerkit build [<context>] [-t <name:tag>] [--base <ref>] [--no-cache]
//! layerkit run <name:tag>
//! layerkit images
//! layerkit inspect <name:tag>
//! layerkit rmi <name:tag>
//! layerkit gc
//! ```
//!
//! Every command accepts `--root <dir>` (store root) and
//! `--isolation chroot|host`. Logs go to stderr (`RUST_LOG`, default
//! `layerkit=info`); stdout belongs to the command output or, for `run`,
//! to the container.

use anyhow::Context;
use layerkit::{
    BuildContext, BuildOptions, BuildRecipe, DEFAULT_IMAGE_TAG, ImageBuilder, Isolation,
    LayerkitConfig, OCI_IMAGE_SPEC_VERSION, Supervisor,
};
use std::path::PathBuf;
use std::process::ExitCode;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Default)]
struct GlobalOpts {
    root: Option<PathBuf>,
    isolation: Option<Isolation>,
}

#[derive(Debug)]
enum Command {
    Build {
        context: PathBuf,
        tag: String,
        base: Option<String>,
        no_cache: bool,
    },
    Run {
        tag: String,
    },
    Images,
    Inspect {
        tag: String,
    },
    Rmi {
        tag: String,
    },
    Gc,
    Version,
    Help,
}

fn parse_args(args: &[String]) -> Result<(Command, GlobalOpts), String> {
    let mut opts = GlobalOpts::default();
    let mut positional = Vec::new();
    let mut tag = None;
    let mut base = None;
    let mut no_cache = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--root" => {
                let value = args.get(i + 1).ok_or("--root requires a directory")?;
                opts.root = Some(PathBuf::from(value));
                i += 2;
            }
            "--isolation" => {
                let value = args.get(i + 1).ok_or("--isolation requires chroot or host")?;
                opts.isolation = Some(value.parse().map_err(|e| format!("{}", e))?);
                i += 2;
            }
            "-t" | "--tag" => {
                tag = Some(args.get(i + 1).ok_or("--tag requires <name:tag>")?.clone());
                i += 2;
            }
            "--base" => {
                base = Some(args.get(i + 1).ok_or("--base requires an image reference")?.clone());
                i += 2;
            }
            "--no-cache" => {
                no_cache = true;
                i += 1;
            }
            flag if flag.starts_with("--") && !matches!(flag, "--help" | "--version") => {
                return Err(format!("unknown option: {}", flag));
            }
            _ => {
                positional.push(args[i].clone());
                i += 1;
            }
        }
    }

    let Some((command, rest)) = positional.split_first() else {
        return Ok((Command::Help, opts));
    };

    let require_tag = |name: &str| -> Result<String, String> {
        rest.first()
            .cloned()
            .ok_or_else(|| format!("{} requires <name:tag>", name))
    };

    let cmd = match command.as_str() {
        "build" => Command::Build {
            context: rest.first().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            tag: tag.unwrap_or_else(|| DEFAULT_IMAGE_TAG.to_string()),
            base,
            no_cache,
        },
        "run" => Command::Run {
            tag: require_tag("run")?,
        },
        "images" => Command::Images,
        "inspect" => Command::Inspect {
            tag: require_tag("inspect")?,
        },
        "rmi" => Command::Rmi {
            tag: require_tag("rmi")?,
        },
        "gc" => Command::Gc,
        "version" | "--version" | "-v" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        unknown => return Err(format!("unknown command: {}", unknown)),
    };
    Ok((cmd, opts))
}

fn load_config(opts: &GlobalOpts) -> anyhow::Result<LayerkitConfig> {
    let mut config = LayerkitConfig::load(opts.root.clone()).context("loading configuration")?;
    if let Some(isolation) = opts.isolation {
        config = config.isolation(isolation);
    }
    Ok(config)
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn cmd_build(
    opts: &GlobalOpts,
    context: PathBuf,
    tag: String,
    base: Option<String>,
    no_cache: bool,
) -> anyhow::Result<()> {
    let config = load_config(opts)?;

    let mut recipe = BuildRecipe::default();
    if let Some(base) = base {
        recipe = recipe.with_base_image(base);
    }
    if let Some(command) = config.install_command.clone() {
        recipe = recipe.with_install_command(command);
    }

    let build_context = BuildContext::load_with_manifest(&context, &recipe.manifest)
        .with_context(|| format!("loading build context {}", context.display()))?;

    let builder = ImageBuilder::new(config)?;
    let report = builder
        .build(&recipe, &build_context, &BuildOptions::new(tag).no_cache(no_cache))
        .await?;

    println!("STEP\tCACHED\tSIZE\tLAYER");
    for step in &report.steps {
        let layer = step
            .layers
            .last()
            .map(|l| l.digest.as_str())
            .unwrap_or("-");
        println!("{}\t{}\t{}\t{}", step.step, step.cached, step.size(), layer);
    }
    println!("{} {}", report.image.tag, report.image.manifest_digest);
    Ok(())
}

async fn cmd_run(opts: &GlobalOpts, tag: String) -> anyhow::Result<i32> {
    let config = load_config(opts)?;
    let supervisor = Supervisor::new(&config)?;
    Ok(supervisor.run(&tag).await?)
}

fn cmd_images(opts: &GlobalOpts) -> anyhow::Result<()> {
    let config = load_config(opts)?;
    let builder = ImageBuilder::new(config)?;

    println!("TAG\tID\tSIZE\tCREATED");
    for image in builder.images().list()? {
        let id = image
            .manifest_digest
            .strip_prefix("sha256:")
            .unwrap_or(&image.manifest_digest);
        println!(
            "{}\t{}\t{}\t{}",
            image.tag,
            &id[..12.min(id.len())],
            image.size,
            image
                .created
                .map(|c| c.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn cmd_inspect(opts: &GlobalOpts, tag: String) -> anyhow::Result<()> {
    let config = load_config(opts)?;
    let builder = ImageBuilder::new(config)?;
    let image = builder.images().get(&tag)?;

    let out = serde_json::json!({
        "tag": image.tag,
        "id": image.manifest_digest,
        "manifest": image.manifest,
        "config": image.config,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_rmi(opts: &GlobalOpts, tag: String) -> anyhow::Result<()> {
    let config = load_config(opts)?;
    let builder = ImageBuilder::new(config)?;
    builder.images().remove(&tag)?;
    eprintln!("Untagged {}", tag);
    Ok(())
}

fn cmd_gc(opts: &GlobalOpts) -> anyhow::Result<()> {
    let config = load_config(opts)?;
    let builder = ImageBuilder::new(config)?;
    let stats = builder.gc()?;
    println!(
        "removed {} blobs, freed {} bytes",
        stats.removed_count, stats.freed_bytes
    );
    Ok(())
}

fn cmd_version() {
    println!("layerkit version {}", env!("CARGO_PKG_VERSION"));
    println!("image spec: {}", OCI_IMAGE_SPEC_VERSION);
}

fn cmd_help() {
    println!(
        r#"layerkit - layered image builder and process supervisor

USAGE:
    layerkit <command> [options]

COMMANDS:
    build [<context>]     Build an image from a context directory (default: .)
    run <name:tag>        Run the image's entrypoint; exits with its code
    images                List built images
    inspect <name:tag>    Show image manifest and config (JSON)
    rmi <name:tag>        Remove an image tag
    gc                    Delete blobs no image or cache entry references
    version               Show version info
    help                  Show this help

OPTIONS:
    -t, --tag <name:tag>          Tag for build (default: app:latest)
    --base <ref>                  Base image (default: python:3.11-slim)
    --no-cache                    Do not reuse cached layers
    --isolation <chroot|host>     Execution mode for build steps and runs
    --root <dir>                  Store root (default: $LAYERKIT_ROOT or ~/.layerkit)

EXAMPLES:
    layerkit build . -t bot:latest
    layerkit run bot:latest
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("layerkit=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let (cmd, opts) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    let result = match cmd {
        Command::Build {
            context,
            tag,
            base,
            no_cache,
        } => cmd_build(&opts, context, tag, base, no_cache).await,
        Command::Run { tag } => match cmd_run(&opts, tag).await {
            // Exit codes outside 0..=255 are truncated the way a shell would.
            Ok(code) => return ExitCode::from((code & 0xff) as u8),
            Err(e) => Err(e),
        },
        Command::Images => cmd_images(&opts),
        Command::Inspect { tag } => cmd_inspect(&opts, tag),
        Command::Rmi { tag } => cmd_rmi(&opts, tag),
        Command::Gc => cmd_gc(&opts),
        Command::Version => {
            cmd_version();
            Ok(())
        }
        Command::Help => {
            cmd_help();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("layerkit")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_build_defaults() {
        let (cmd, opts) = parse_args(&args(&["build"])).unwrap();
        match cmd {
            Command::Build {
                context,
                tag,
                base,
                no_cache,
            } => {
                assert_eq!(context, PathBuf::from("."));
                assert_eq!(tag, DEFAULT_IMAGE_TAG);
                assert!(base.is_none());
                assert!(!no_cache);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(opts.root.is_none());
    }

    #[test]
    fn test_parse_build_flags() {
        let (cmd, opts) = parse_args(&args(&[
            "build", "./ctx", "-t", "bot:v1", "--no-cache", "--isolation", "host", "--root", "/tmp/s",
        ]))
        .unwrap();
        assert!(matches!(cmd, Command::Build { ref tag, no_cache: true, .. } if tag == "bot:v1"));
        assert_eq!(opts.isolation, Some(Isolation::Host));
        assert_eq!(opts.root, Some(PathBuf::from("/tmp/s")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&["run"])).is_err());
        assert!(parse_args(&args(&["bogus"])).is_err());
        assert!(parse_args(&args(&["build", "--isolation", "vm"])).is_err());
        assert!(matches!(parse_args(&args(&[])).unwrap().0, Command::Help));
    }
}
