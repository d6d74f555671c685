//! 后台线程工具

use crossbeam_channel::RecvTimeoutError;
use std::thread::{JoinHandle, spawn};
use std::time::Duration;

/// 带上限的 `join`：超时后放弃等待（线程本身不会被终止）
pub(crate) trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        // 由辅助线程阻塞在 join 上，这里只等待它的结果
        spawn(move || {
            let _ = done_tx.send(self.join().map(drop));
        });

        match done_rx.recv_timeout(timeout) {
            Ok(joined) => joined,
            Err(RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("worker still running after {timeout:?}"),
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(Box::new(std::io::Error::other(
                "join helper exited without a result",
            ))),
        }
    }
}

/// 线程退出等待上限
pub(crate) const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_timeout_finished() {
        let handle = spawn(|| 42);
        assert!(handle.join_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_join_timeout_expires() {
        let handle = spawn(|| std::thread::sleep(Duration::from_millis(300)));
        assert!(handle.join_timeout(Duration::from_millis(10)).is_err());
    }
}
