mod config;

use std::env;
use std::error::Error;

use common::RuleType;
use library::{
    Catalog, DuplicateDecision, DuplicatePolicy, FolderRoots, LibraryFilter, Scanner,
};
use metadata::ParsedSong;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{
    config_path_from_env, load_or_create_config, resolve_path, CatalogConfig, DuplicateMode,
};

const USAGE: &str = "usage: abc_catalog [scan | songs [search] | rules | add-exclude <path> [--include-in-export] | add-rule <library|export|exclude> <path> | remove-rule <id> | instruments]";
const PROGRESS_EVERY: usize = 100;

/// Answers every duplicate question the same way, as configured.
struct ConfiguredPolicy {
    mode: DuplicateMode,
}

impl DuplicatePolicy for ConfiguredPolicy {
    fn resolve(
        &mut self,
        path: &str,
        parsed: &ParsedSong,
        candidates: &[u64],
    ) -> Option<DuplicateDecision> {
        let decision = match self.mode {
            DuplicateMode::Separate => Some(DuplicateDecision::Separate),
            DuplicateMode::Link => candidates.first().copied().map(DuplicateDecision::Link),
            DuplicateMode::Ignore => Some(DuplicateDecision::Ignore),
        };
        info!(
            "{} ({:?}) matches {} songs: {:?}",
            path,
            parsed.title,
            candidates.len(),
            decision
        );
        decision
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "scan".to_string());
    let rest: Vec<String> = args.collect();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Wrote default config to {:?}", config_path);
    }
    let index_path = resolve_path(&config_path, &config.index_path);
    let catalog = Catalog::open(&index_path)?;

    match command.as_str() {
        "scan" => scan(&catalog, &config, &config_path),
        "songs" => songs(&catalog, rest.first().map(String::as_str)),
        "rules" => print_lines(&catalog.list_folder_rules()?),
        "add-exclude" => add_exclude(&catalog, &rest),
        "add-rule" => add_rule(&catalog, &rest),
        "remove-rule" => remove_rule(&catalog, &rest),
        "instruments" => print_lines(&catalog.list_instruments()?),
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(format!("unknown command {:?}\n{}", other, USAGE).into()),
    }
}

fn scan(
    catalog: &Catalog,
    config: &CatalogConfig,
    config_path: &std::path::Path,
) -> Result<(), Box<dyn Error>> {
    let source = FolderRoots {
        catalog,
        configured: config.configured_roots(config_path),
    };
    let report = Scanner::new(catalog)
        .with_policy(ConfiguredPolicy {
            mode: config.duplicate_policy,
        })
        .with_progress(|done, total| {
            if done % PROGRESS_EVERY == 0 || done == total {
                debug!("Scanned {}/{}", done, total);
            }
        })
        .scan_export_roots(config.scan_export_roots)
        .empty_roots(config.empty_roots_policy())
        .run(&source)?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn songs(catalog: &Catalog, search: Option<&str>) -> Result<(), Box<dyn Error>> {
    let filter = LibraryFilter {
        title: search.map(str::to_string),
        ..LibraryFilter::default()
    };
    print_lines(&catalog.list_library_songs(&filter)?)
}

fn add_exclude(catalog: &Catalog, args: &[String]) -> Result<(), Box<dyn Error>> {
    let path = args
        .iter()
        .find(|arg| !arg.starts_with("--"))
        .ok_or("add-exclude needs a path")?;
    let include_in_export = args.iter().any(|arg| arg == "--include-in-export");
    let rule = catalog.add_folder_rule(RuleType::Exclude, path, true, include_in_export)?;
    print_lines(&[rule])
}

fn add_rule(catalog: &Catalog, args: &[String]) -> Result<(), Box<dyn Error>> {
    let (kind, path) = match args {
        [kind, path, ..] => (kind, path),
        _ => return Err("add-rule needs <library|export|exclude> <path>".into()),
    };
    let rule_type = RuleType::parse(kind).ok_or_else(|| format!("unknown rule type {:?}", kind))?;
    let rule = catalog.add_folder_rule(rule_type, path, true, false)?;
    print_lines(&[rule])
}

fn remove_rule(catalog: &Catalog, args: &[String]) -> Result<(), Box<dyn Error>> {
    let id: u64 = args
        .first()
        .ok_or("remove-rule needs an id")?
        .parse()
        .map_err(|_| "rule id must be a number")?;
    if !catalog.delete_folder_rule(id)? {
        return Err(format!("no folder rule {}", id).into());
    }
    info!("Removed folder rule {}", id);
    Ok(())
}

fn print_lines<T: Serialize>(items: &[T]) -> Result<(), Box<dyn Error>> {
    for item in items {
        println!("{}", serde_json::to_string(item)?);
    }
    Ok(())
}
