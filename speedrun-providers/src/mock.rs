//! Scripted in-memory marketplace and transport.
//!
//! Both record every external call into a shared [`CallJournal`] so callers
//! can assert on ordering (e.g. that destroy is the last call of a run).

use crate::transport::{ExecOutput, RemoteProcess, RemoteSession, RemoteTransport};
use crate::{inventory, Marketplace};
use anyhow::Result;
use async_trait::async_trait;
use speedrun_common::{Endpoint, Instance, Offer};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct CallJournal {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: impl Into<String>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call.into());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn last(&self) -> Option<String> {
        self.entries().last().cloned()
    }
}

// -----------------------------------------------------------------------------
// Marketplace
// -----------------------------------------------------------------------------

pub struct MockMarketplace {
    journal: CallJournal,
    search_results: Mutex<VecDeque<Vec<Offer>>>,
    search_error: Option<String>,
    create_result: std::result::Result<u64, String>,
    polls: Mutex<VecDeque<Vec<Instance>>>,
    destroy_error: Option<String>,
}

impl MockMarketplace {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            journal,
            search_results: Mutex::new(VecDeque::new()),
            search_error: None,
            create_result: Ok(1),
            polls: Mutex::new(VecDeque::new()),
            destroy_error: None,
        }
    }

    /// One response per search call, in order. Calls past the end get an empty list.
    pub fn with_search_results(self, results: Vec<Vec<Offer>>) -> Self {
        *self.search_results.lock().unwrap_or_else(|e| e.into_inner()) = results.into();
        self
    }

    pub fn with_search_error(mut self, msg: &str) -> Self {
        self.search_error = Some(msg.to_string());
        self
    }

    pub fn with_contract(mut self, contract_id: u64) -> Self {
        self.create_result = Ok(contract_id);
        self
    }

    pub fn with_create_error(mut self, msg: &str) -> Self {
        self.create_result = Err(msg.to_string());
        self
    }

    /// One instance list per poll, in order. The last list repeats forever.
    pub fn with_polls(self, polls: Vec<Vec<Instance>>) -> Self {
        *self.polls.lock().unwrap_or_else(|e| e.into_inner()) = polls.into();
        self
    }

    pub fn with_destroy_error(mut self, msg: &str) -> Self {
        self.destroy_error = Some(msg.to_string());
        self
    }
}

#[async_trait]
impl Marketplace for MockMarketplace {
    async fn search_offers(&self, query: &inventory::OfferQuery) -> Result<Vec<Offer>> {
        self.journal.record(format!("search:{}", query.filter));
        if let Some(msg) = &self.search_error {
            return Err(anyhow::anyhow!("{}", msg));
        }
        let mut results = self.search_results.lock().unwrap_or_else(|e| e.into_inner());
        Ok(results.pop_front().unwrap_or_default())
    }

    async fn create_instance(&self, spec: &inventory::LaunchSpec) -> Result<u64> {
        self.journal.record(format!("create:{}", spec.offer_id));
        match &self.create_result {
            Ok(id) => Ok(*id),
            Err(msg) => Err(speedrun_common::SpeedrunError::Provisioning(msg.clone()).into()),
        }
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.journal.record("list");
        let mut polls = self.polls.lock().unwrap_or_else(|e| e.into_inner());
        if polls.len() > 1 {
            Ok(polls.pop_front().unwrap_or_default())
        } else {
            Ok(polls.front().cloned().unwrap_or_default())
        }
    }

    async fn destroy_instance(&self, contract_id: u64) -> Result<()> {
        self.journal.record(format!("destroy:{}", contract_id));
        match &self.destroy_error {
            Some(msg) => Err(anyhow::anyhow!("{}", msg)),
            None => Ok(()),
        }
    }
}

// -----------------------------------------------------------------------------
// Transport
// -----------------------------------------------------------------------------

#[derive(Clone)]
struct ScriptedExec {
    needle: String,
    output: ExecOutput,
}

/// Local paths handed to `put`, in call order.
#[derive(Clone, Default)]
pub struct UploadLog {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl UploadLog {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn push(&self, path: &Path) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.push(path.to_path_buf());
        }
    }
}

#[derive(Clone)]
struct Script {
    exec: Vec<ScriptedExec>,
    stream_lines: Vec<String>,
    stream_exit: i32,
    fail_on: Option<String>,
    hang_on: Option<String>,
    panic_on: Option<String>,
    connect_error: Option<String>,
    uploads: UploadLog,
}

pub struct MockTransport {
    journal: CallJournal,
    script: Script,
}

impl MockTransport {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            journal,
            script: Script {
                exec: Vec::new(),
                stream_lines: Vec::new(),
                stream_exit: 0,
                fail_on: None,
                hang_on: None,
                panic_on: None,
                connect_error: None,
                uploads: UploadLog::default(),
            },
        }
    }

    /// Reply to any `exec` whose command contains `needle`. First match wins;
    /// unmatched commands succeed with empty output.
    pub fn on_exec(mut self, needle: &str, exit_code: i32, stdout: &str) -> Self {
        self.script.exec.push(ScriptedExec {
            needle: needle.to_string(),
            output: ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        });
        self
    }

    pub fn with_stream(mut self, lines: &[&str], exit_code: i32) -> Self {
        self.script.stream_lines = lines.iter().map(|l| l.to_string()).collect();
        self.script.stream_exit = exit_code;
        self
    }

    /// Make any session operation whose journal entry contains `needle` fail.
    pub fn fail_on(mut self, needle: &str) -> Self {
        self.script.fail_on = Some(needle.to_string());
        self
    }

    /// Make any session operation whose journal entry contains `needle`
    /// record itself and then never complete.
    pub fn hang_on(mut self, needle: &str) -> Self {
        self.script.hang_on = Some(needle.to_string());
        self
    }

    /// Make any session operation whose journal entry contains `needle`
    /// record itself and then panic.
    pub fn panic_on(mut self, needle: &str) -> Self {
        self.script.panic_on = Some(needle.to_string());
        self
    }

    pub fn with_connect_error(mut self, msg: &str) -> Self {
        self.script.connect_error = Some(msg.to_string());
        self
    }

    pub fn upload_log(&self) -> UploadLog {
        self.script.uploads.clone()
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn RemoteSession>> {
        self.journal.record(format!("connect:{}", endpoint));
        if let Some(msg) = &self.script.connect_error {
            return Err(anyhow::anyhow!("{}", msg));
        }
        Ok(Box::new(MockSession {
            journal: self.journal.clone(),
            script: self.script.clone(),
        }))
    }
}

struct MockSession {
    journal: CallJournal,
    script: Script,
}

impl MockSession {
    async fn record(&self, entry: String) -> Result<()> {
        let hits = |needle: &Option<String>| {
            needle
                .as_deref()
                .map(|needle| entry.contains(needle))
                .unwrap_or(false)
        };
        let failing = hits(&self.script.fail_on);
        let hanging = hits(&self.script.hang_on);
        let panicking = hits(&self.script.panic_on);
        self.journal.record(entry.clone());

        if panicking {
            panic!("scripted panic: {}", entry);
        }
        if hanging {
            std::future::pending::<()>().await;
        }
        if failing {
            return Err(anyhow::anyhow!("injected failure: {}", entry));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.record(format!("exec:{}", command)).await?;
        let output = self
            .script
            .exec
            .iter()
            .find(|s| command.contains(&s.needle))
            .map(|s| s.output.clone())
            .unwrap_or(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        Ok(output)
    }

    async fn exec_streaming(&self, command: &str) -> Result<RemoteProcess> {
        self.record(format!("stream:{}", command)).await?;
        let (tx, rx) = mpsc::channel(self.script.stream_lines.len().max(1));
        let lines = self.script.stream_lines.clone();
        let exit_code = self.script.stream_exit;
        let exit = tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok::<i32, anyhow::Error>(exit_code)
        });
        Ok(RemoteProcess { lines: rx, exit })
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.script.uploads.push(local);
        self.record(format!("put:{}", remote)).await?;
        if !local.is_file() {
            return Err(anyhow::anyhow!("local file {} does not exist", local.display()));
        }
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        self.record(format!("get:{}", remote)).await?;
        tokio::fs::write(local, format!("mock contents of {}", remote)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.journal.record("close");
        Ok(())
    }
}
