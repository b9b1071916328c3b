//! 工作线程 (Machine)
//!
//! M - 操作系统线程，运行一个调度循环

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::local;
use super::scheduler::Scheduler;
use crate::config::RUNTIME_NAME;
use crate::error::{Result, RuntimeError};

/// 工作线程
pub struct Machine {
    /// 线程序号（与 Processor ID 相同）
    pub id: usize,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Machine {
    /// 启动工作线程
    ///
    /// 线程先自旋等待运行时启动，然后进入调度循环
    pub fn start(scheduler: Arc<Scheduler>, id: usize) -> Result<Arc<Self>> {
        let handle = thread::Builder::new()
            .name(format!("{}-machine-{}", RUNTIME_NAME, id))
            .spawn(move || {
                if let Err(e) = local::worker_main(scheduler, id) {
                    tracing::error!(machine = id, error = %e, "machine exited with error");
                }
            })
            .map_err(RuntimeError::ThreadSpawn)?;

        Ok(Arc::new(Self {
            id,
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// 等待线程结束
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(machine = self.id, "machine thread panicked");
            }
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
