// 镜像加载监控线程，周期性对比加载器 epoch 计数并触发注册表刷新
// 没有可靠的加载回调可用，轮询是兜底手段：burst 阶段密集探测，空闲后指数退避
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::registry::scan::{self, ModuleEpoch};
use crate::errno::Errno;
use crate::log;

const REFRESH_INTERVAL_MIN: Duration = Duration::from_millis(500);
const REFRESH_INTERVAL_MAX: Duration = Duration::from_secs(8);
const BURST_ROUNDS: u8 = 3;

// 轮询间隔状态，模块变化后回到最小间隔重新 burst
struct PollState {
    interval: Duration,
    burst_rounds: u8,
    last_epoch: Option<ModuleEpoch>,
}

impl PollState {
    fn new() -> Self {
        PollState {
            interval: REFRESH_INTERVAL_MIN,
            burst_rounds: BURST_ROUNDS,
            last_epoch: scan::module_epoch(),
        }
    }

    fn timeout(&self) -> Duration {
        self.interval
    }

    fn on_round(&mut self, changed: bool) {
        if changed {
            self.interval = REFRESH_INTERVAL_MIN;
            self.burst_rounds = BURST_ROUNDS;
            return;
        }
        if self.burst_rounds > 0 {
            self.burst_rounds -= 1;
            return;
        }
        let doubled_ms = self
            .interval
            .as_millis()
            .saturating_mul(2)
            .min(REFRESH_INTERVAL_MAX.as_millis()) as u64;
        self.interval = Duration::from_millis(doubled_ms);
    }

    // epoch 不可得时保守判定为变化，强制走一次全量刷新
    fn poll_changed(&mut self) -> bool {
        let Some(epoch) = scan::module_epoch() else {
            self.last_epoch = None;
            return true;
        };
        let changed = self.last_epoch != Some(epoch);
        self.last_epoch = Some(epoch);
        changed
    }
}

pub(crate) struct LoadMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoadMonitor {
    // refresh 回调里做注册表刷新和缓存修剪
    pub(crate) fn start(refresh: impl Fn() + Send + 'static) -> Result<Self, Errno> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let builder = thread::Builder::new().name("veil_core_monitor".to_string());
        let handle = builder
            .spawn(move || monitor_loop(&stop_flag, refresh))
            .map_err(|_| Errno::InitErrMonitor)?;
        Ok(LoadMonitor {
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LoadMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn monitor_loop(stop: &AtomicBool, refresh: impl Fn()) {
    let mut poll = PollState::new();
    log::debug(format_args!("load monitor started"));

    while !stop.load(Ordering::Acquire) {
        thread::sleep(poll.timeout());
        if stop.load(Ordering::Acquire) {
            break;
        }
        let changed = poll.poll_changed();
        if changed {
            log::debug(format_args!("module epoch changed, refreshing registry"));
            refresh();
        }
        poll.on_round(changed);
    }
    log::debug(format_args!("load monitor stopped"));
}

#[cfg(test)]
mod tests {
    use super::{BURST_ROUNDS, LoadMonitor, PollState, REFRESH_INTERVAL_MIN};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn backoff_starts_after_burst_rounds() {
        let mut state = PollState::new();
        for _ in 0..BURST_ROUNDS {
            state.on_round(false);
        }
        assert_eq!(state.timeout(), REFRESH_INTERVAL_MIN);

        state.on_round(false);
        assert_eq!(
            state.timeout(),
            Duration::from_millis(REFRESH_INTERVAL_MIN.as_millis() as u64 * 2)
        );
    }

    #[test]
    fn change_resets_interval() {
        let mut state = PollState::new();
        for _ in 0..8 {
            state.on_round(false);
        }
        assert!(state.timeout() > REFRESH_INTERVAL_MIN);

        state.on_round(true);
        assert_eq!(state.timeout(), REFRESH_INTERVAL_MIN);
    }

    #[test]
    fn stop_joins_the_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&count);
        let mut monitor = LoadMonitor::start(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        monitor.stop();
        // stop 后不再有刷新产生
        let after = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after);
    }
}
