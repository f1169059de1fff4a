use std::path::{Path, PathBuf};

use common::{normalize_path, FolderRule, RuleType};
use redb::ReadableTable;
use tracing::debug;

use crate::classify::RootSet;
use crate::scan::RootSource;
use crate::{
    decode_value, encode_value, next_id, now_secs, read_all, Catalog, LibraryError,
    FOLDER_RULES_TABLE,
};

/// Single roots configured outside the rule table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfiguredRoots {
    pub library_root: Option<PathBuf>,
    pub export_root: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct FolderRuleUpdate {
    pub path: Option<String>,
    pub enabled: Option<bool>,
    pub include_in_export: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportExcludeRule {
    pub path: PathBuf,
    pub include_in_export: bool,
}

/// Rule table plus configured roots, as a scan root source.
pub struct FolderRoots<'a> {
    pub catalog: &'a Catalog,
    pub configured: ConfiguredRoots,
}

impl RootSource for FolderRoots<'_> {
    fn enabled_roots(&self) -> Result<RootSet, LibraryError> {
        self.catalog.enabled_roots(&self.configured)
    }
}

impl Catalog {
    pub fn add_folder_rule(
        &self,
        rule_type: RuleType,
        path: &str,
        enabled: bool,
        include_in_export: bool,
    ) -> Result<FolderRule, LibraryError> {
        let path = clean_rule_path(path)?;
        let write_txn = self.db.begin_write()?;
        let now = now_secs();
        let rule = FolderRule {
            id: next_id(&write_txn, "folder_rules")?,
            rule_type,
            path,
            enabled,
            include_in_export,
            created_at: now,
            updated_at: now,
        };
        {
            let mut table = write_txn.open_table(FOLDER_RULES_TABLE)?;
            let bytes = encode_value(&rule)?;
            table.insert(rule.id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        debug!("Added {} rule {:?}", rule.rule_type.as_str(), rule.path);
        Ok(rule)
    }

    pub fn update_folder_rule(
        &self,
        id: u64,
        update: FolderRuleUpdate,
    ) -> Result<FolderRule, LibraryError> {
        let path = match &update.path {
            Some(path) => Some(clean_rule_path(path)?),
            None => None,
        };
        let write_txn = self.db.begin_write()?;
        let rule = {
            let mut table = write_txn.open_table(FOLDER_RULES_TABLE)?;
            let mut rule: FolderRule = match table.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(LibraryError::NotFound(format!("folder rule {}", id))),
            };
            if let Some(path) = path {
                rule.path = path;
            }
            if let Some(enabled) = update.enabled {
                rule.enabled = enabled;
            }
            if let Some(include) = update.include_in_export {
                rule.include_in_export = include;
            }
            rule.updated_at = now_secs();
            let bytes = encode_value(&rule)?;
            table.insert(id, bytes.as_slice())?;
            rule
        };
        write_txn.commit()?;
        Ok(rule)
    }

    /// Returns `false` when no rule had this id.
    pub fn delete_folder_rule(&self, id: u64) -> Result<bool, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(FOLDER_RULES_TABLE)?;
            let removed = table.remove(id)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn list_folder_rules(&self) -> Result<Vec<FolderRule>, LibraryError> {
        let mut rules: Vec<FolderRule> = read_all(&self.db, FOLDER_RULES_TABLE)?;
        rules.sort_by(|a, b| {
            rule_order(a.rule_type)
                .cmp(&rule_order(b.rule_type))
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(rules)
    }

    /// Effective roots for a scan: configured roots plus enabled rules.
    /// Library and export roots that are not directories are dropped.
    pub fn enabled_roots(&self, configured: &ConfiguredRoots) -> Result<RootSet, LibraryError> {
        let rules = self.list_folder_rules()?;

        let mut library = Vec::new();
        let mut export = Vec::new();
        library.extend(configured.library_root.clone());
        export.extend(configured.export_root.clone());
        for rule in rules.iter().filter(|rule| rule.enabled) {
            match rule.rule_type {
                RuleType::LibraryRoot => library.push(PathBuf::from(&rule.path)),
                RuleType::ExportRoot => export.push(PathBuf::from(&rule.path)),
                RuleType::Exclude => {}
            }
        }
        let library = existing_dirs(library);
        let export = existing_dirs(export);

        let base = library.first().cloned();
        let excludes: Vec<PathBuf> = rules
            .iter()
            .filter(|rule| rule.enabled && rule.rule_type == RuleType::Exclude)
            .map(|rule| resolve_against(&rule.path, base.as_deref()))
            .collect();

        Ok(RootSet::new(library, export, excludes))
    }

    /// Enabled exclude rules, resolved, with their export flag.
    pub fn exclude_rules_for_export(
        &self,
        configured: &ConfiguredRoots,
    ) -> Result<Vec<ExportExcludeRule>, LibraryError> {
        let roots = self.enabled_roots(configured)?;
        let base = roots.library_roots.first().cloned();
        let rules = self
            .list_folder_rules()?
            .into_iter()
            .filter(|rule| rule.enabled && rule.rule_type == RuleType::Exclude)
            .map(|rule| ExportExcludeRule {
                path: normalize_path(&resolve_against(&rule.path, base.as_deref())),
                include_in_export: rule.include_in_export,
            })
            .collect();
        Ok(rules)
    }
}

/// The longest matching exclude rule decides; paths under no rule export.
pub fn included_in_export(path: &Path, rules: &[ExportExcludeRule]) -> bool {
    let path = normalize_path(path);
    rules
        .iter()
        .filter(|rule| path.starts_with(&rule.path))
        .max_by_key(|rule| rule.path.components().count())
        .map(|rule| rule.include_in_export)
        .unwrap_or(true)
}

fn clean_rule_path(path: &str) -> Result<String, LibraryError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(LibraryError::InvalidInput("empty folder rule path".to_string()));
    }
    Ok(trimmed.to_string())
}

fn resolve_against(path: &str, base: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(path);
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

fn existing_dirs(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .map(|path| normalize_path(&path))
        .filter(|path| {
            let exists = path.is_dir();
            if !exists {
                debug!("Dropping root {:?}: not a directory", path);
            }
            exists
        })
        .collect()
}

fn rule_order(rule_type: RuleType) -> u8 {
    match rule_type {
        RuleType::LibraryRoot => 0,
        RuleType::ExportRoot => 1,
        RuleType::Exclude => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_catalog;
    use std::fs;

    #[test]
    fn rule_crud_round() {
        let (_dir, catalog) = temp_catalog();
        let rule = catalog
            .add_folder_rule(RuleType::Exclude, "  /m/Old  ", true, false)
            .unwrap();
        assert_eq!(rule.path, "/m/Old");

        let updated = catalog
            .update_folder_rule(
                rule.id,
                FolderRuleUpdate {
                    include_in_export: Some(true),
                    ..FolderRuleUpdate::default()
                },
            )
            .unwrap();
        assert!(updated.include_in_export);
        assert!(updated.enabled);
        assert_eq!(catalog.list_folder_rules().unwrap(), vec![updated]);

        assert!(catalog.delete_folder_rule(rule.id).unwrap());
        assert!(!catalog.delete_folder_rule(rule.id).unwrap());
        assert!(catalog.list_folder_rules().unwrap().is_empty());
    }

    #[test]
    fn blank_rule_path_is_rejected() {
        let (_dir, catalog) = temp_catalog();
        assert!(matches!(
            catalog.add_folder_rule(RuleType::LibraryRoot, "   ", true, false),
            Err(LibraryError::InvalidInput(_))
        ));
    }

    #[test]
    fn enabled_roots_merge_config_and_rules() {
        let (dir, catalog) = temp_catalog();
        let music = dir.path().join("Music");
        let extra = dir.path().join("Extra");
        let export = dir.path().join("Export");
        for path in [&music, &extra, &export] {
            fs::create_dir_all(path).unwrap();
        }
        catalog
            .add_folder_rule(RuleType::LibraryRoot, &extra.to_string_lossy(), true, false)
            .unwrap();
        catalog
            .add_folder_rule(RuleType::LibraryRoot, "/definitely/not/here", true, false)
            .unwrap();
        catalog
            .add_folder_rule(RuleType::ExportRoot, &export.to_string_lossy(), false, false)
            .unwrap();
        catalog.add_folder_rule(RuleType::Exclude, "Old", true, false).unwrap();

        let configured = ConfiguredRoots {
            library_root: Some(music.clone()),
            export_root: None,
        };
        let roots = catalog.enabled_roots(&configured).unwrap();
        assert_eq!(
            roots.library_roots,
            vec![normalize_path(&music), normalize_path(&extra)]
        );
        assert!(roots.export_roots.is_empty());
        assert_eq!(roots.exclude_paths, vec![normalize_path(&music).join("Old")]);
    }

    #[test]
    fn folder_roots_is_a_root_source() {
        let (dir, catalog) = temp_catalog();
        let source = FolderRoots {
            catalog: &catalog,
            configured: ConfiguredRoots {
                library_root: Some(dir.path().to_path_buf()),
                export_root: None,
            },
        };
        let roots = source.enabled_roots().unwrap();
        assert_eq!(roots.library_roots.len(), 1);
    }

    #[test]
    fn most_specific_exclude_rule_wins_for_export() {
        let rules = vec![
            ExportExcludeRule {
                path: PathBuf::from("/no/such/music/old"),
                include_in_export: false,
            },
            ExportExcludeRule {
                path: PathBuf::from("/no/such/music/old/keep"),
                include_in_export: true,
            },
        ];
        assert!(!included_in_export(Path::new("/no/such/music/old/a.abc"), &rules));
        assert!(included_in_export(Path::new("/no/such/music/old/keep/a.abc"), &rules));
        assert!(included_in_export(Path::new("/no/such/music/new/a.abc"), &rules));
    }

    #[test]
    fn export_rules_resolve_relative_paths() {
        let (dir, catalog) = temp_catalog();
        catalog.add_folder_rule(RuleType::Exclude, "Drafts", true, true).unwrap();
        catalog.add_folder_rule(RuleType::Exclude, "Off", false, false).unwrap();
        let configured = ConfiguredRoots {
            library_root: Some(dir.path().to_path_buf()),
            export_root: None,
        };
        let rules = catalog.exclude_rules_for_export(&configured).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].path, normalize_path(dir.path()).join("Drafts"));
        assert!(rules[0].include_in_export);
    }
}
