// src/psm/triggers.rs

//! Trigger matching and execution
//!
//! Two directions: triggers other installed packages carry on the package
//! changing state ("out"), and the changing package's own triggers on
//! packages already installed ("in").

use crate::db::models::InstalledPackage;
use crate::error::Result;
use crate::package::{PackageHeader, TriggerSense};
use crate::psm::scriptlet::{ScriptRequest, ScriptRunner, ScriptSlot};
use crate::transaction::element::Goal;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::debug;

/// Shared inputs of one trigger pass
pub struct TriggerContext<'c, 'r> {
    pub conn: &'c Connection,
    pub runner: &'r ScriptRunner<'r>,
    pub goal: Goal,
    /// Added to instance counts of the changing package (-1 while it is
    /// being erased but still recorded)
    pub count_correction: i64,
}

impl TriggerContext<'_, '_> {
    fn count(&self, name: &str) -> Result<i64> {
        InstalledPackage::count_by_name(self.conn, name)
    }

    /// Fire triggers that other installed packages carry on `source`
    ///
    /// Returns the number of scripts run.
    pub fn run_out(&self, source: &PackageHeader, source_instance: Option<i64>, sense: TriggerSense) -> Result<usize> {
        let mut names: Vec<&str> = vec![source.name.as_str()];
        names.extend(source.provides.iter().map(|p| p.name.as_str()));

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for name in names {
            for package in InstalledPackage::find_triggered_by(self.conn, name)? {
                let Some(instance) = package.instance else {
                    continue;
                };
                if Some(instance) == source_instance || !seen.insert(instance) {
                    continue;
                }
                candidates.push(package);
            }
        }

        let source_count = self.count(&source.name)? + self.count_correction;
        let mut ran = 0;
        for triggered in &candidates {
            let mut fired = HashSet::new();
            for trigger in &triggered.header.triggers {
                if trigger.sense != sense || !source.satisfies(&trigger.condition) {
                    continue;
                }
                if !fired.insert(trigger.script) {
                    continue;
                }
                let triggered_count = self.count(&triggered.header.name)?;
                self.fire(triggered, trigger.script, sense, triggered_count, source_count)?;
                ran += 1;
            }
        }
        Ok(ran)
    }

    /// Fire `package`'s own triggers on the installed packages they watch
    pub fn run_in(&self, package: &PackageHeader, own_instance: Option<i64>, sense: TriggerSense) -> Result<usize> {
        let own_count = self.count(&package.name)? + self.count_correction;
        let mut fired = HashSet::new();
        let mut ran = 0;

        for trigger in package.triggers.iter().filter(|t| t.sense == sense) {
            for source in InstalledPackage::find_by_capability(self.conn, &trigger.condition.name)? {
                let Some(instance) = source.instance else {
                    continue;
                };
                if Some(instance) == own_instance || !source.header.satisfies(&trigger.condition) {
                    continue;
                }
                if !fired.insert((instance, trigger.script)) {
                    continue;
                }
                let source_count = self.count(&source.header.name)?;
                self.fire(package, trigger.script, sense, own_count, source_count)?;
                ran += 1;
            }
        }
        Ok(ran)
    }

    fn fire(
        &self,
        triggered: &impl AsHeader,
        script: usize,
        sense: TriggerSense,
        triggered_count: i64,
        source_count: i64,
    ) -> Result<()> {
        let header = triggered.as_header();
        let Some(scriptlet) = header.trigger_scripts.get(script) else {
            debug!("{} has no trigger script {}", header.nevra(), script);
            return Ok(());
        };

        let nevra = header.nevra();
        let request = ScriptRequest {
            package: &nevra,
            slot: ScriptSlot::Trigger(sense),
            script: scriptlet,
            args: vec![triggered_count, source_count],
            prefixes: &header.prefixes,
        };
        self.runner.run_for(self.goal, &request)
    }
}

/// Anything a trigger script can be read from
trait AsHeader {
    fn as_header(&self) -> &PackageHeader;
}

impl AsHeader for PackageHeader {
    fn as_header(&self) -> &PackageHeader {
        self
    }
}

impl AsHeader for InstalledPackage {
    fn as_header(&self) -> &PackageHeader {
        &self.header
    }
}
