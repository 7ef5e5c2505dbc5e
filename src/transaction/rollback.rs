// src/transaction/rollback.rs

//! Reverse transactions for partially applied runs

use crate::config::{ProblemFilter, TransactionConfig};
use crate::db::models::InstalledPackage;
use crate::error::{Error, Result};
use crate::transaction::element::{Goal, TransactionElement};
use rusqlite::Connection;
use tracing::{info, warn};

/// Config for the reverse transaction of a run made with `config`
///
/// Problem checks are all waived, a second rollback is never attempted,
/// and erases are not repackaged again. Scriptlets and triggers still run.
pub fn rollback_config(config: &TransactionConfig) -> TransactionConfig {
    let mut rollback = config.clone();
    rollback.flags.rollback_on_failure = false;
    rollback.flags.repackage = false;
    rollback.filter = ProblemFilter {
        ignore_arch: true,
        ignore_os: true,
        replace_pkg: true,
        old_package: true,
        replace_new_files: true,
        replace_old_files: true,
        disk_space: true,
        disk_nodes: true,
        force_relocate: true,
    };
    rollback
}

/// Elements that undo `applied`, newest first
///
/// An applied install becomes an erase of the record it added. An applied
/// erase becomes an install of its repackaged copy, or a database-only
/// reinstall of its old record when no copy was written.
pub fn reverse_elements(conn: &Connection, applied: &[&TransactionElement]) -> Result<Vec<TransactionElement>> {
    let mut reversed = Vec::with_capacity(applied.len());

    for element in applied.iter().rev() {
        match element.goal {
            Goal::Install => {
                let Some(instance) = element.db_instance else {
                    continue;
                };
                let record = InstalledPackage::find_by_instance(conn, instance)?.ok_or_else(|| {
                    Error::Rollback(format!("record of {} disappeared before rollback", element.nevra()))
                })?;
                info!("Rollback will erase {}", element.nevra());
                reversed.push(TransactionElement::erase(record));
            }
            Goal::Erase => match &element.repackaged {
                Some(path) => {
                    info!("Rollback will reinstall {} from {}", element.nevra(), path.display());
                    reversed.push(TransactionElement::install(path)?);
                }
                None => {
                    warn!(
                        "{} was not repackaged, rollback restores its record only",
                        element.nevra()
                    );
                    let mut header = element.header.clone();
                    header.install_time = None;
                    reversed.push(TransactionElement::install_header(header, None));
                }
            },
        }
    }

    Ok(reversed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::package::PackageHeader;
    use tempfile::NamedTempFile;

    fn conn() -> (NamedTempFile, Connection) {
        let db = NamedTempFile::new().unwrap();
        let conn = Connection::open(db.path()).unwrap();
        schema::migrate(&conn).unwrap();
        (db, conn)
    }

    #[test]
    fn test_reverse_order_and_goals() {
        let (_db, conn) = conn();
        let mut new = InstalledPackage::new(PackageHeader::new("foo", "2", "1", "noarch"), 5);
        let instance = new.insert(&conn).unwrap();

        let mut install = TransactionElement::install_header(PackageHeader::new("foo", "2", "1", "noarch"), None);
        install.db_instance = Some(instance);
        let old = InstalledPackage::new(PackageHeader::new("foo", "1", "1", "noarch"), 1);
        let erase = TransactionElement::erase(old);

        let reversed = reverse_elements(&conn, &[&install, &erase]).unwrap();
        assert_eq!(reversed.len(), 2);
        assert_eq!(reversed[0].goal, Goal::Install);
        assert_eq!(reversed[0].nevra(), "foo-1-1.noarch");
        assert!(reversed[0].package_path.is_none());
        assert_eq!(reversed[1].goal, Goal::Erase);
        assert_eq!(reversed[1].db_instance, Some(instance));
    }

    #[test]
    fn test_missing_record_is_a_rollback_error() {
        let (_db, conn) = conn();
        let mut install = TransactionElement::install_header(PackageHeader::new("foo", "2", "1", "noarch"), None);
        install.db_instance = Some(999);
        let err = reverse_elements(&conn, &[&install]).unwrap_err();
        assert!(matches!(err, Error::Rollback(_)));
    }

    #[test]
    fn test_rollback_config_waives_checks() {
        let mut config = TransactionConfig::default();
        config.flags.rollback_on_failure = true;
        let rollback = rollback_config(&config);
        assert!(!rollback.flags.rollback_on_failure);
        assert!(rollback.filter.replace_old_files);
        assert!(!rollback.flags.no_scripts);
    }
}
