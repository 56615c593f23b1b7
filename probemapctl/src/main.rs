use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use cli_table::{print_stdout, Cell, CellStruct, Style, Table};
use probemaps::{
    layout::{read_section, write_section},
    load_all,
    logging::setup_tracing,
    manifest::load_manifest,
    settings::Settings,
    DryRunLoader, MapDescriptor, MapSet,
};
use probemaps_common::{MapFlags, MapType, Pinning};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[cfg_attr(
        debug_assertions,
        arg(
            long,
            global = true,
            env = "PROBEMAPS_LOG_LEVEL",
            default_value = "debug",
            value_parser = ["trace", "debug", "info", "warn", "error"]
        )
    )]
    #[cfg_attr(
        not(debug_assertions),
        arg(
            long,
            global = true,
            env = "PROBEMAPS_LOG_LEVEL",
            default_value = "warn",
            value_parser = ["trace", "debug", "info", "warn", "error"]
        )
    )]
    log_level: String,

    #[arg(
        long,
        global = true,
        env = "PROBEMAPS_LOG_FMT",
        default_value = "text",
        value_parser = ["json", "text"]
    )]
    log_fmt: String,

    /// Configuration file. Without it, the system-wide one is used if it
    /// exists.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Sub,
}

#[derive(Subcommand)]
enum Sub {
    /// Validate a manifest and list the maps it declares.
    Check {
        /// Path to the TOML manifest.
        manifest: PathBuf,
    },
    /// Write the loader-facing map section of a manifest.
    Emit {
        /// Path to the TOML manifest.
        manifest: PathBuf,
        /// Where to write the section image.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Decode and validate a section image.
    Inspect {
        /// Path to the section image.
        image: PathBuf,
    },
    /// Show the creation requests a loader would issue, in order.
    Plan {
        /// Path to the TOML manifest.
        manifest: PathBuf,
    },
    /// List the supported map kinds.
    Kinds {
        /// Show only this kind.
        #[arg(long, value_enum)]
        kind: Option<MapType>,
    },
}

fn load_settings(config: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = match config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::new()?,
    };
    debug!(
        strict = settings.strict_validation,
        ring_buffer_page_aligned = settings.ring_buffer_page_aligned,
        page_size = settings.page_size,
        max_entries_limit = settings.max_entries_limit,
        "loaded settings"
    );
    Ok(settings)
}

fn format_flags(flags: MapFlags) -> String {
    if flags.is_empty() {
        return "-".to_owned();
    }
    flags
        .iter_names()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("|")
}

fn format_pinning(pinning: Pinning) -> &'static str {
    match pinning {
        Pinning::None => "-",
        Pinning::ByName => "by_name",
    }
}

fn format_capacity(kind: MapType, max_entries: u32) -> String {
    if kind.capacity_in_bytes() {
        format!("{} bytes", max_entries)
    } else {
        max_entries.to_string()
    }
}

fn descriptor_row(desc: &MapDescriptor) -> Vec<CellStruct> {
    vec![
        desc.name().cell(),
        desc.kind().cell(),
        desc.key_size().cell(),
        desc.value_size().cell(),
        format_capacity(desc.kind(), desc.max_entries()).cell(),
        format_flags(desc.flags()).cell(),
        format_pinning(desc.pinning()).cell(),
    ]
}

fn descriptor_title() -> Vec<CellStruct> {
    vec![
        "Name".cell().bold(true),
        "Kind".cell().bold(true),
        "Key Size".cell().bold(true),
        "Value Size".cell().bold(true),
        "Max Entries".cell().bold(true),
        "Flags".cell().bold(true),
        "Pinning".cell().bold(true),
    ]
}

fn print_set(set: &MapSet) -> anyhow::Result<()> {
    let table = set
        .iter()
        .map(descriptor_row)
        .collect::<Vec<_>>()
        .table()
        .title(descriptor_title());
    print_stdout(table)?;
    Ok(())
}

fn check(settings: &Settings, manifest: &Path) -> anyhow::Result<MapSet> {
    let set = load_manifest(manifest, &settings.builder()?)?;
    info!(maps = set.len(), "manifest is valid");
    Ok(set)
}

fn emit(settings: &Settings, manifest: &Path, output: &Path) -> anyhow::Result<MapSet> {
    let set = load_manifest(manifest, &settings.builder()?)?;
    let f = File::create(output)?;
    write_section(&set, BufWriter::new(f))?;
    info!(maps = set.len(), output = %output.display(), "wrote map section");
    Ok(set)
}

/// Decodes the image and validates every record again. Records which don't
/// validate are reported, not skipped.
fn inspect(settings: &Settings, image: &Path) -> anyhow::Result<Vec<Vec<CellStruct>>> {
    let records = read_section(BufReader::new(File::open(image)?))?;
    let builder = settings.builder()?;

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let status = match record.to_descriptor(&builder) {
            Ok(_) => "ok".to_owned(),
            Err(e) => {
                warn!(error = e.to_string().as_str(), "invalid record");
                e.to_string()
            }
        };
        let kind = record.def.map_type();
        rows.push(vec![
            record.name.as_str().cell(),
            match record.object_name() {
                Ok(name) => name.as_str().unwrap_or("<invalid>").to_owned(),
                Err(_) => "<invalid>".to_owned(),
            }
            .cell(),
            kind.map(|k| k.as_str()).unwrap_or("<unknown>").cell(),
            record.def.key_size.cell(),
            record.def.value_size.cell(),
            match kind {
                Some(kind) => format_capacity(kind, record.def.max_entries),
                None => record.def.max_entries.to_string(),
            }
            .cell(),
            format_flags(record.def.flags()).cell(),
            format_pinning(record.pinning).cell(),
            status.cell(),
        ]);
    }
    Ok(rows)
}

fn plan(settings: &Settings, manifest: &Path) -> anyhow::Result<DryRunLoader> {
    let set = load_manifest(manifest, &settings.builder()?)?;
    let mut loader = DryRunLoader::new();
    load_all(&set, &mut loader)?;
    Ok(loader)
}

fn print_plan(loader: &DryRunLoader) -> anyhow::Result<()> {
    let table = loader
        .requests()
        .iter()
        .enumerate()
        .map(|(i, req)| {
            vec![
                i.cell(),
                req.name.as_str().cell(),
                req.def.type_.cell(),
                req.def.key_size.cell(),
                req.def.value_size.cell(),
                req.def.max_entries.cell(),
                format!("{:#x}", req.def.map_flags).cell(),
                format_pinning(req.pinning).cell(),
            ]
        })
        .collect::<Vec<_>>()
        .table()
        .title(vec![
            "#".cell().bold(true),
            "Name".cell().bold(true),
            "Type ID".cell().bold(true),
            "Key Size".cell().bold(true),
            "Value Size".cell().bold(true),
            "Max Entries".cell().bold(true),
            "Map Flags".cell().bold(true),
            "Pinning".cell().bold(true),
        ]);
    print_stdout(table)?;
    Ok(())
}

fn kinds(kind: Option<MapType>) -> anyhow::Result<()> {
    let table = MapType::ALL
        .iter()
        .filter(|k| kind.map_or(true, |kind| kind == **k))
        .map(|k| {
            let key = match (k.is_byte_oriented(), k.implicit_key_size()) {
                (true, _) => "synthetic".to_owned(),
                (false, Some(_)) => "u32 index".to_owned(),
                (false, None) if *k == MapType::LpmTrie => "prefix + data".to_owned(),
                (false, None) => "any".to_owned(),
            };
            vec![
                k.cell(),
                k.type_id().cell(),
                key.cell(),
                k.is_per_cpu().cell(),
                k.evicts().cell(),
                format_flags(k.required_flags()).cell(),
                k.describe().cell(),
            ]
        })
        .collect::<Vec<_>>()
        .table()
        .title(vec![
            "Kind".cell().bold(true),
            "Type ID".cell().bold(true),
            "Key".cell().bold(true),
            "Per CPU".cell().bold(true),
            "Evicts".cell().bold(true),
            "Required Flags".cell().bold(true),
            "Semantics".cell().bold(true),
        ]);
    print_stdout(table)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing(&args.log_level, &args.log_fmt)?;

    match args.subcommand {
        Sub::Check { manifest } => {
            let settings = load_settings(args.config.as_deref())?;
            print_set(&check(&settings, &manifest)?)?;
        }
        Sub::Emit { manifest, output } => {
            let settings = load_settings(args.config.as_deref())?;
            print_set(&emit(&settings, &manifest, &output)?)?;
        }
        Sub::Inspect { image } => {
            let settings = load_settings(args.config.as_deref())?;
            let mut title = descriptor_title();
            title.insert(1, "Object Name".cell().bold(true));
            title.push("Status".cell().bold(true));
            print_stdout(inspect(&settings, &image)?.table().title(title))?;
        }
        Sub::Plan { manifest } => {
            let settings = load_settings(args.config.as_deref())?;
            print_plan(&plan(&settings, &manifest)?)?;
        }
        Sub::Kinds { kind } => kinds(kind)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;

    static MANIFEST: &str = r#"
[[maps]]
name = "PIDS"
kind = "lru_hash"
key_size = 4
value_size = 32
max_entries = 10240

[[maps]]
name = "JUMP_TABLE"
kind = "prog_array"
max_entries = 8

[[maps]]
name = "EVENTS"
kind = "ring_buffer"
max_entries = 65536
"#;

    fn test_settings() -> Settings {
        let dir = tempdir().unwrap();
        let path = dir.path().join("probemaps.toml");
        File::create(&path)
            .unwrap()
            .write_all(b"strict_validation = true\n")
            .unwrap();
        Settings::from_file(&path).unwrap()
    }

    fn write_manifest(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("maps.toml");
        File::create(&path)
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();
        path
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from([
            "probemapctl",
            "--log-fmt",
            "json",
            "emit",
            "maps.toml",
            "-o",
            "maps.bin",
        ])
        .unwrap();
        assert_eq!(args.log_fmt, "json");
        assert!(matches!(args.subcommand, Sub::Emit { .. }));

        let args = Args::try_parse_from(["probemapctl", "kinds", "--kind", "lpm-trie"]).unwrap();
        assert!(matches!(
            args.subcommand,
            Sub::Kinds {
                kind: Some(MapType::LpmTrie)
            }
        ));

        assert!(Args::try_parse_from(["probemapctl", "--log-fmt", "xml", "kinds"]).is_err());
    }

    #[test]
    fn flags_formatting() {
        assert_eq!(format_flags(MapFlags::empty()), "-");
        assert_eq!(format_flags(MapFlags::NO_PREALLOC), "no_prealloc");
        assert_eq!(
            format_flags(MapFlags::NO_PREALLOC | MapFlags::RDONLY_PROG),
            "no_prealloc|rdonly_prog"
        );
    }

    #[test]
    fn capacity_formatting() {
        assert_eq!(format_capacity(MapType::RingBuffer, 4096), "4096 bytes");
        assert_eq!(format_capacity(MapType::Hash, 4096), "4096");
    }

    #[test]
    fn emit_then_inspect() {
        let dir = tempdir().unwrap();
        let settings = test_settings();
        let manifest = write_manifest(dir.path(), MANIFEST);
        let image = dir.path().join("maps.bin");

        let set = emit(&settings, &manifest, &image).unwrap();
        assert_eq!(set.len(), 3);

        let rows = inspect(&settings, &image).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn plan_keeps_declaration_order() {
        let dir = tempdir().unwrap();
        let manifest = write_manifest(dir.path(), MANIFEST);

        let loader = plan(&test_settings(), &manifest).unwrap();
        let names: Vec<_> = loader.requests().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["PIDS", "JUMP_TABLE", "EVENTS"]);
        assert_eq!(loader.requests()[1].def.type_, MapType::ProgArray.type_id());
    }

    #[test]
    fn long_names_pass_through_emit() {
        let dir = tempdir().unwrap();
        let settings = test_settings();
        let manifest = write_manifest(
            dir.path(),
            r#"
[[maps]]
name = "process_exec_events"
kind = "ring_buffer"
max_entries = 1024
"#,
        );
        let image = dir.path().join("maps.bin");

        let set = emit(&settings, &manifest, &image).unwrap();
        assert!(set.get("process_exec_events").is_some());
        assert_eq!(inspect(&settings, &image).unwrap().len(), 1);

        let loader = plan(&settings, &manifest).unwrap();
        assert_eq!(loader.requests()[0].name, "process_exec_events");
    }

    #[test]
    fn check_rejects_invalid_manifest() {
        let dir = tempdir().unwrap();
        let manifest = write_manifest(
            dir.path(),
            r#"
[[maps]]
name = "EVENTS"
kind = "ring_buffer"
max_entries = 5000
"#,
        );
        assert!(check(&test_settings(), &manifest).is_err());
    }
}
