// src/transaction/sanity.rs

//! Pre-run package checks: platform, installed versions, relocations

use crate::config::TransactionConfig;
use crate::db::models::InstalledPackage;
use crate::error::Result;
use crate::transaction::element::{Goal, TransactionElement};
use crate::transaction::problems::{Problem, ProblemKind, ProblemSet};
use rusqlite::Connection;
use std::collections::HashSet;

/// Package architectures each platform can run, best match first
const ARCH_COMPAT: &[(&str, &[&str])] = &[
    ("x86_64", &["x86_64", "amd64", "athlon", "i686", "i586", "i486", "i386"]),
    ("amd64", &["amd64", "x86_64", "athlon", "i686", "i586", "i486", "i386"]),
    ("i686", &["i686", "i586", "i486", "i386"]),
    ("i586", &["i586", "i486", "i386"]),
    ("i486", &["i486", "i386"]),
    ("i386", &["i386"]),
    ("aarch64", &["aarch64", "arm64"]),
    ("arm64", &["arm64", "aarch64"]),
    ("armv7hl", &["armv7hl", "armv6hl"]),
    ("ppc64le", &["ppc64le"]),
    ("ppc64", &["ppc64", "ppc"]),
    ("s390x", &["s390x", "s390"]),
    ("riscv64", &["riscv64"]),
];

/// Whether a package built for `package_arch` runs on `platform_arch`
pub fn arch_compatible(platform_arch: &str, package_arch: &str) -> bool {
    if package_arch == "noarch" || package_arch == platform_arch {
        return true;
    }
    ARCH_COMPAT
        .iter()
        .find(|(platform, _)| *platform == platform_arch)
        .is_some_and(|(_, compatible)| compatible.contains(&package_arch))
}

/// Relocations the package does not allow
pub fn check_relocations(element: &TransactionElement, problems: &mut ProblemSet) {
    for relocation in element.invalid_relocations() {
        problems.push(
            Problem::new(ProblemKind::BadRelocate, element.nevra()).with_detail(relocation.old_prefix.clone()),
        );
    }
}

/// Platform and installed-version checks for every install element
pub fn check_elements(
    conn: &Connection,
    config: &TransactionConfig,
    elements: &[TransactionElement],
    problems: &mut ProblemSet,
) -> Result<()> {
    let removed: HashSet<i64> = elements
        .iter()
        .filter(|e| e.goal == Goal::Erase)
        .filter_map(|e| e.db_instance)
        .collect();

    for element in elements.iter().filter(|e| e.goal == Goal::Install) {
        check_element(conn, config, element, &removed, problems)?;
    }
    Ok(())
}

fn check_element(
    conn: &Connection,
    config: &TransactionConfig,
    element: &TransactionElement,
    removed: &HashSet<i64>,
    problems: &mut ProblemSet,
) -> Result<()> {
    let header = &element.header;
    let nevra = element.nevra();

    if !arch_compatible(&config.platform_arch, &header.arch) {
        problems.push(Problem::new(ProblemKind::BadArch, nevra.clone()).with_detail(header.arch.clone()));
    }
    if !header.os.eq_ignore_ascii_case(&config.platform_os) {
        problems.push(Problem::new(ProblemKind::BadOs, nevra.clone()).with_detail(header.os.clone()));
    }

    let evr = header.evr();
    for installed in InstalledPackage::find_by_name(conn, &header.name)? {
        let being_removed = installed.instance.is_some_and(|i| removed.contains(&i));

        if installed.header.nevra() == nevra {
            if !being_removed {
                problems.push(Problem::new(ProblemKind::PkgInstalled, nevra.clone()));
            }
        } else if installed.header.evr() > evr {
            problems.push(Problem::new(ProblemKind::OldPackage, nevra.clone()).with_alt(installed.header.nevra()));
        }
    }

    Ok(())
}
