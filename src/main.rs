use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use captionary::export::ExportFormat;
use captionary::scanner::{self, HashError, DEFAULT_SIMILARITY_THRESHOLD};
use captionary::sidecar::RecordPatch;
use captionary::{logging, Config, Workbench};

enum Command {
    Open(PathBuf),
    Caption {
        dir: PathBuf,
        file: String,
        text: String,
    },
    Tag {
        dir: PathBuf,
        file: String,
        tags: Vec<String>,
    },
    Hash(Vec<PathBuf>),
    Compare {
        left: String,
        right: String,
        threshold: Option<u32>,
    },
    Duplicates(PathBuf),
    Import(PathBuf),
    Export {
        dir: PathBuf,
        output: PathBuf,
        format: Option<ExportFormat>,
    },
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("captionary {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            arg if arg.starts_with('-') && arg.len() > 1 => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    match parse_command(&positional) {
        Ok(command) => Args {
            config_path,
            command,
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    }
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some((name, rest)) = args.split_first() else {
        bail!("missing command");
    };

    let command = match (name.as_str(), rest) {
        ("open", [dir]) => Command::Open(dir.into()),
        ("caption", [dir, file, text]) => Command::Caption {
            dir: dir.into(),
            file: file.clone(),
            text: text.clone(),
        },
        ("tag", [dir, file, tags @ ..]) => Command::Tag {
            dir: dir.into(),
            file: file.clone(),
            tags: tags.to_vec(),
        },
        ("hash", files) if !files.is_empty() => Command::Hash(files.iter().map(PathBuf::from).collect()),
        ("compare", [left, right]) => Command::Compare {
            left: left.clone(),
            right: right.clone(),
            threshold: None,
        },
        ("compare", [left, right, threshold]) => Command::Compare {
            left: left.clone(),
            right: right.clone(),
            threshold: Some(
                threshold
                    .parse()
                    .with_context(|| format!("invalid threshold {:?}", threshold))?,
            ),
        },
        ("duplicates", [dir]) => Command::Duplicates(dir.into()),
        ("import", [csv]) => Command::Import(csv.into()),
        ("export", [dir, output]) => Command::Export {
            dir: dir.into(),
            output: output.into(),
            format: None,
        },
        ("export", [dir, output, format]) => Command::Export {
            dir: dir.into(),
            output: output.into(),
            format: Some(format.parse()?),
        },
        (other, _) => bail!("unknown command or wrong arguments: {}", other),
    };
    Ok(command)
}

fn print_help() {
    println!(
        r#"captionary - image identity and caption sidecars

USAGE:
    captionary [OPTIONS] <COMMAND>

COMMANDS:
    open DIR                    Reconcile a folder and report identities
    caption DIR FILE TEXT       Set the caption of one image
    tag DIR FILE [TAG...]       Replace the tags of one image
    hash IMAGE...               Print perceptual fingerprints
    compare HASH_A HASH_B [N]   Compare two hex fingerprints (default threshold: {threshold})
    duplicates DIR              List groups of similar images and shared identities
    import CSV                  Import tabular metadata into the metadata store
    export DIR OUT [json|csv]   Export the identities of a folder

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    CAPTIONARY_CONFIG   Path to config file (overrides default location)
    CAPTIONARY_LOG      Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/captionary/config.toml"#,
        threshold = DEFAULT_SIMILARITY_THRESHOLD
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // Logging failures must not stop the command
    let _ = logging::init(None);

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match args.command {
        Command::Hash(files) => {
            for file in files {
                match scanner::compute_fingerprint_file(&file) {
                    Ok(hash) => println!("{}  {}", hash, file.display()),
                    Err(e) => eprintln!("{}: {}", file.display(), e),
                }
            }
            Ok(())
        }
        Command::Compare {
            left,
            right,
            threshold,
        } => {
            let threshold = threshold.unwrap_or(config.scanner.similarity_threshold);
            let (distance, similar) = compare_fingerprints(&left, &right, threshold)?;
            println!(
                "distance {} -> {}",
                distance,
                if similar { "similar" } else { "different" }
            );
            Ok(())
        }
        command => run_session(config, command).await,
    }
}

async fn run_session(config: Config, command: Command) -> Result<()> {
    let mut bench = Workbench::open(config);
    let result = run_with(&mut bench, command).await;

    let stats = bench.shutdown().await;
    if stats.failed > 0 {
        eprintln!("warning: {} metadata sync job(s) failed", stats.failed);
    }
    result
}

async fn run_with(bench: &mut Workbench, command: Command) -> Result<()> {
    match command {
        Command::Open(dir) => {
            let report = bench.open_folder(&dir).await?;
            for entry in bench.collection().entries() {
                println!(
                    "{}  {}  {}",
                    entry.identity.uuid,
                    entry.identity.p_hash.as_deref().unwrap_or("----------------"),
                    entry.filename
                );
            }
            println!(
                "{} images: {} adopted, {} new, {} failed",
                report.total, report.adopted, report.minted, report.failed
            );
        }
        Command::Caption { dir, file, text } => {
            edit_one(bench, &dir, &file, RecordPatch::caption(text)).await?;
        }
        Command::Tag { dir, file, tags } => {
            edit_one(bench, &dir, &file, RecordPatch::tags(tags)).await?;
        }
        Command::Duplicates(dir) => {
            let report = bench.open_folder(&dir).await?;
            let groups = bench.similar_groups();
            for (n, group) in groups.iter().enumerate() {
                println!("group {}:", n + 1);
                for entry in group {
                    println!("    {}", entry.filename);
                }
            }
            for uuid in &report.duplicate_uuids {
                println!("shared identity {}", uuid);
            }
            if groups.is_empty() && report.duplicate_uuids.is_empty() {
                println!("no duplicates");
            }
        }
        Command::Import(csv) => {
            let summary = bench.import_csv(&csv).await?;
            println!("{} rows created, {} updated", summary.created, summary.updated);
        }
        Command::Export {
            dir,
            output,
            format,
        } => {
            let format = match format {
                Some(format) => format,
                None => format_from_extension(&output)?,
            };
            bench.open_folder(&dir).await?;
            let count = bench.export(&output, format)?;
            println!("exported {} images to {}", count, output.display());
        }
        Command::Hash(_) | Command::Compare { .. } => {}
    }
    Ok(())
}

async fn edit_one(bench: &mut Workbench, dir: &Path, file: &str, patch: RecordPatch) -> Result<()> {
    bench.open_folder(dir).await?;
    let Some(entry) = bench.entry_by_filename(file) else {
        bail!("{} is not an image in {}", file, dir.display());
    };
    let id = entry.id;
    bench.edit(id, patch)?;
    bench.flush_edits().await;

    if let Some(entry) = bench.collection().get(id) {
        println!("{}  {:?}  {:?}", entry.identity.uuid, entry.identity.caption, entry.identity.tags);
    }
    Ok(())
}

/// Distance and verdict for two hex fingerprints. Fingerprints of different
/// lengths are refused outright.
fn compare_fingerprints(left: &str, right: &str, threshold: u32) -> Result<(u32, bool)> {
    let distance = match scanner::hamming_distance(left, right) {
        Ok(distance) => distance,
        Err(e @ HashError::InputMismatch { .. }) => {
            bail!("cannot compare {:?} with {:?}: {}", left, right, e)
        }
        Err(e) => return Err(e.into()),
    };
    let similar = scanner::are_similar(left, right, threshold)?;
    Ok((distance, similar))
}

fn format_from_extension(path: &Path) -> Result<ExportFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.parse(),
        None => bail!("cannot infer export format from {}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_compare() {
        let command = parse_command(&args(&["compare", "00ff", "00fe", "3"])).unwrap();
        match command {
            Command::Compare {
                left,
                right,
                threshold,
            } => {
                assert_eq!(left, "00ff");
                assert_eq!(right, "00fe");
                assert_eq!(threshold, Some(3));
            }
            _ => panic!("expected compare"),
        }

        let command = parse_command(&args(&["compare", "a", "b"])).unwrap();
        assert!(matches!(command, Command::Compare { threshold: None, .. }));
        assert!(parse_command(&args(&["compare", "a", "b", "ten"])).is_err());
        assert!(parse_command(&args(&["compare", "a"])).is_err());
    }

    #[test]
    fn test_parse_other_commands() {
        assert!(matches!(parse_command(&args(&["open", "/tmp"])).unwrap(), Command::Open(_)));
        assert!(matches!(
            parse_command(&args(&["tag", "/tmp", "a.png"])).unwrap(),
            Command::Tag { ref tags, .. } if tags.is_empty()
        ));
        assert!(matches!(
            parse_command(&args(&["export", "/tmp", "out.csv", "json"])).unwrap(),
            Command::Export { format: Some(ExportFormat::Json), .. }
        ));
        assert!(parse_command(&args(&["hash"])).is_err());
        assert!(parse_command(&args(&[])).is_err());
    }

    #[test]
    fn test_compare_fingerprints() {
        let zero = "0000000000000000";
        let nine = "00000000000001ff";
        let eleven = "00000000000007ff";

        assert_eq!(compare_fingerprints(zero, nine, 10).unwrap(), (9, true));
        assert_eq!(compare_fingerprints(zero, eleven, 10).unwrap(), (11, false));
        assert_eq!(compare_fingerprints(zero, "00000000000000FF", 8).unwrap(), (8, true));
    }

    #[test]
    fn test_compare_rejects_length_mismatch() {
        let err = compare_fingerprints("0000000000000000", "00ff", 10).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
        assert!(compare_fingerprints("000000000000000g", "0000000000000000", 10).is_err());
    }
}
