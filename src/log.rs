use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

pub const LOG_LEVEL_DEBUG: i32 = 3;
pub const LOG_LEVEL_INFO: i32 = 4;
pub const LOG_LEVEL_WARN: i32 = 5;
pub const LOG_LEVEL_ERROR: i32 = 6;

#[cfg(target_os = "android")]
const LOG_TAG_ANDROID: &[u8] = b"veil_core\0";

static LOG_PRIORITY: AtomicI32 = AtomicI32::new(LOG_LEVEL_WARN);

#[cfg(target_os = "android")]
#[link(name = "log")]
unsafe extern "C" {
    fn __android_log_write(prio: i32, tag: *const i8, text: *const i8) -> i32;
}

// 设置日志级别，启用时输出 DEBUG 及以上，禁用时仅输出 WARN 及以上
pub fn set_debug_enabled(enabled: bool) {
    let priority = if enabled {
        LOG_LEVEL_DEBUG
    } else {
        LOG_LEVEL_WARN
    };
    LOG_PRIORITY.store(priority, Ordering::SeqCst);
}

fn enabled(priority: i32) -> bool {
    LOG_PRIORITY.load(Ordering::Relaxed) <= priority
}

#[cfg(target_os = "android")]
fn write_log(priority: i32, args: fmt::Arguments) {
    if !enabled(priority) {
        return;
    }

    unsafe {
        let mut text = format!("{args}").into_bytes();
        for byte in &mut text {
            if *byte == 0 {
                *byte = b' ';
            }
        }
        text.push(0);

        __android_log_write(
            priority,
            LOG_TAG_ANDROID.as_ptr() as *const i8,
            text.as_ptr() as *const i8,
        );
    }
}

#[cfg(not(target_os = "android"))]
fn write_log(priority: i32, args: fmt::Arguments) {
    use std::io::Write;

    if !enabled(priority) {
        return;
    }

    let level = match priority {
        LOG_LEVEL_DEBUG => "D",
        LOG_LEVEL_INFO => "I",
        LOG_LEVEL_WARN => "W",
        _ => "E",
    };
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "veil_core {level} {args}");
}

pub(crate) fn info(args: fmt::Arguments) {
    write_log(LOG_LEVEL_INFO, args);
}

pub(crate) fn debug(args: fmt::Arguments) {
    write_log(LOG_LEVEL_DEBUG, args);
}

pub(crate) fn warn(args: fmt::Arguments) {
    write_log(LOG_LEVEL_WARN, args);
}

pub(crate) fn error(args: fmt::Arguments) {
    write_log(LOG_LEVEL_ERROR, args);
}
