#![allow(dead_code)]

use keos::{sync::SpinLock, Config, Scheduler};
use std::sync::Arc;

pub fn boot() -> &'static Scheduler {
    keos::boot(Config::default()).unwrap()
}

pub fn boot_with(config: Config) -> &'static Scheduler {
    keos::boot(config).unwrap()
}

/// Events recorded by kernel threads, in the order they happened.
#[derive(Clone)]
pub struct Record<T>(Arc<SpinLock<Vec<T>>>);

impl<T: Clone> Record<T> {
    pub fn new() -> Self {
        Self(Arc::new(SpinLock::new(Vec::new())))
    }

    pub fn push(&self, event: T) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<T> {
        self.0.lock().clone()
    }
}
