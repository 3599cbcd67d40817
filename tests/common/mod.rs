//! Scripted process runner shared by the integration tests.
//!
//! Each `spawn` pops the next [`Script`] and plays it through a `ProcessHandle::channel`
//! pair, so tests see the same handle the real runner produces without starting programs.

#![allow(dead_code)]

use autoglm_panel::services::{
    CommandSpec, ProcessError, ProcessHandle, ProcessRunner, ProcessSignal,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the next spawned "process" does
#[derive(Debug, Clone)]
pub enum Script {
    /// Print `lines`, then exit with `code`
    Exit {
        lines: Vec<String>,
        code: Option<i32>,
    },
    /// Print `lines`, then run until signalled. Exits 143 on terminate when
    /// `honors_terminate`, otherwise only a kill stops it.
    Hang {
        lines: Vec<String>,
        honors_terminate: bool,
    },
    /// Print `lines` one at a time with `delay` between them, then exit 0
    Slow { lines: Vec<String>, delay: Duration },
    /// The program cannot be found
    NotFound,
    /// Never print or exit on its own and ignore terminate
    Stuck,
    /// Print `lines`, then vanish without reporting an exit status
    Lost { lines: Vec<String> },
}

impl Script {
    pub fn exit(lines: &[&str], code: i32) -> Self {
        Script::Exit {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            code: Some(code),
        }
    }

    pub fn hang(lines: &[&str], honors_terminate: bool) -> Self {
        Script::Hang {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            honors_terminate,
        }
    }
}

#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<VecDeque<Script>>,
    spawned: Mutex<Vec<CommandSpec>>,
    signals: Arc<Mutex<Vec<ProcessSignal>>>,
}

impl FakeRunner {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Default::default()
        })
    }

    /// Specs passed to `spawn`, in call order
    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.spawned.lock().unwrap().clone()
    }

    /// Signals the fake processes received, in order
    pub fn signals(&self) -> Vec<ProcessSignal> {
        self.signals.lock().unwrap().clone()
    }
}

impl ProcessRunner for FakeRunner {
    fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        self.spawned.lock().unwrap().push(spec.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Exit {
                lines: vec![],
                code: Some(0),
            });

        match script {
            Script::Exit { lines, code } => Ok(ProcessHandle::completed(lines, code)),
            Script::NotFound => Err(ProcessError::NotFound(spec.program.clone())),
            Script::Slow { lines, delay } => {
                let (handle, driver) = ProcessHandle::channel(Some(4242));
                tokio::spawn(async move {
                    for line in lines {
                        tokio::time::sleep(delay).await;
                        driver.send_line(line);
                    }
                    driver.exit(Some(0));
                });
                Ok(handle)
            }
            Script::Hang {
                lines,
                honors_terminate,
            } => {
                let (handle, mut driver) = ProcessHandle::channel(Some(4242));
                for line in lines {
                    driver.send_line(line);
                }
                let signals = Arc::clone(&self.signals);
                tokio::spawn(async move {
                    while let Some(signal) = driver.recv_signal().await {
                        signals.lock().unwrap().push(signal);
                        match signal {
                            ProcessSignal::Terminate if honors_terminate => {
                                driver.send_line("received SIGTERM, exiting");
                                driver.exit(Some(143));
                                return;
                            }
                            ProcessSignal::Kill => {
                                driver.exit(None);
                                return;
                            }
                            ProcessSignal::Terminate => {}
                        }
                    }
                });
                Ok(handle)
            }
            Script::Lost { lines } => {
                let (handle, driver) = ProcessHandle::channel(Some(4242));
                for line in lines {
                    driver.send_line(line);
                }
                drop(driver);
                Ok(handle)
            }
            Script::Stuck => {
                let (handle, mut driver) = ProcessHandle::channel(Some(4242));
                let signals = Arc::clone(&self.signals);
                tokio::spawn(async move {
                    while let Some(signal) = driver.recv_signal().await {
                        signals.lock().unwrap().push(signal);
                    }
                    drop(driver);
                });
                Ok(handle)
            }
        }
    }
}
