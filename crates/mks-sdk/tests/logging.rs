//! 日志初始化（独立测试进程：全局订阅器只能安装一次）

use mks_sdk::logging::{LOG_ENV, env_filter, init_logging, init_logging_with};
use serial_test::serial;

#[test]
#[serial]
fn test_init_is_idempotent() {
    // 唯一调用 init 的测试：这里总是从未安装的状态开始
    let racers: Vec<_> = (0..8)
        .map(|_| std::thread::spawn(init_logging))
        .collect();
    for racer in racers {
        racer.join().unwrap().unwrap();
    }

    init_logging().unwrap();
    init_logging_with("debug").unwrap();
    tracing::info!("logging works");
}

#[test]
#[serial]
fn test_invalid_directive_falls_back() {
    // SAFETY: serial 测试，期间没有其他线程读取环境变量
    unsafe { std::env::set_var(LOG_ENV, "mks_driver=notalevel") };
    let filter = env_filter("warn");
    unsafe { std::env::remove_var(LOG_ENV) };
    assert_eq!(filter.to_string(), "warn");
}

#[test]
#[serial]
fn test_env_directive_wins() {
    unsafe { std::env::set_var(LOG_ENV, "mks_can=trace") };
    let filter = env_filter("warn");
    unsafe { std::env::remove_var(LOG_ENV) };
    assert_eq!(filter.to_string(), "mks_can=trace");
}
