#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use ctor::ctor;
use log::{LevelFilter, Log, Metadata, Record};
use tinyproc::{Kernel, KernelConfig, Task};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{:5} {:?}] {}",
                record.level(),
                thread::current().name().unwrap_or("host"),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

#[ctor]
fn init_logger() {
    let level = std::env::var("TINYPROC_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LevelFilter::Warn);
    if log::set_logger(&StderrLogger).is_ok() {
        log::set_max_level(level);
    }
}

/// Boots a kernel whose init process runs `init`, and returns init's exit
/// status once it halts.
pub fn run<F>(init: F) -> i32
where
    F: Fn(&[u8]) -> i32 + Send + Sync + 'static,
{
    run_with(KernelConfig::default(), init)
}

pub fn run_with<F>(config: KernelConfig, init: F) -> i32
where
    F: Fn(&[u8]) -> i32 + Send + Sync + 'static,
{
    let kernel = Kernel::boot(config, Task::new(init), &[]).unwrap();
    kernel.wait_halt()
}

pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

/// An ordered log of events shared between tasks.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
