// 引擎操作审计记录的写入、格式化与导出
use crate::api::{
    RECORD_ITEM_ADDR, RECORD_ITEM_DETAIL, RECORD_ITEM_ERRNO, RECORD_ITEM_GROUP, RECORD_ITEM_OP,
    RECORD_ITEM_STUB, RECORD_ITEM_TIMESTAMP,
};
use crate::errno::Errno;
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

// 环形缓冲区上限，超出后淘汰最早的记录
const MAX_RECORDS: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RecordOp {
    GroupInstall,
    Hook,
}

#[derive(Clone, Debug)]
pub(crate) struct RecordEntry {
    pub(crate) op: RecordOp,
    pub(crate) ts_ms: u64,
    pub(crate) status_code: i32,
    pub(crate) group: String,
    pub(crate) detail: String,
    pub(crate) addr: usize,
    pub(crate) stub: u64,
}

pub(crate) struct RecordState {
    pub(crate) recordable: bool,
    pub(crate) entries: Vec<RecordEntry>,
}

impl RecordState {
    pub(crate) fn new() -> Self {
        RecordState {
            recordable: false,
            entries: Vec::new(),
        }
    }
}

#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

// recordable 关闭时静默丢弃，满时淘汰队首
#[inline]
fn push_record(state: &mut RecordState, entry: RecordEntry) {
    if !state.recordable {
        return;
    }
    if state.entries.len() >= MAX_RECORDS {
        state.entries.remove(0);
    }
    state.entries.push(entry);
}

pub(crate) fn add_hook_record(
    state: &mut RecordState,
    status_code: i32,
    group: &str,
    detail: &str,
    addr: usize,
    stub: u64,
) {
    push_record(
        state,
        RecordEntry {
            op: RecordOp::Hook,
            ts_ms: now_ms(),
            status_code,
            group: group.to_string(),
            detail: detail.to_string(),
            addr,
            stub,
        },
    );
}

pub(crate) fn add_group_record(state: &mut RecordState, status_code: i32, group: &str) {
    push_record(
        state,
        RecordEntry {
            op: RecordOp::GroupInstall,
            ts_ms: now_ms(),
            status_code,
            group: group.to_string(),
            detail: String::new(),
            addr: 0,
            stub: 0,
        },
    );
}

fn op_name(op: RecordOp) -> &'static str {
    match op {
        RecordOp::GroupInstall => "GROUP",
        RecordOp::Hook => "HOOK",
    }
}

// 按 item_flags 位掩码选择性输出字段，CSV 格式
fn format_entry(entry: &RecordEntry, item_flags: u32) -> String {
    let mut line = String::new();
    if item_flags & RECORD_ITEM_TIMESTAMP != 0 {
        let _ = write!(line, "{},", entry.ts_ms);
    }
    if item_flags & RECORD_ITEM_GROUP != 0 {
        let _ = write!(line, "{},", entry.group);
    }
    if item_flags & RECORD_ITEM_OP != 0 {
        let _ = write!(line, "{},", op_name(entry.op));
    }
    if item_flags & RECORD_ITEM_DETAIL != 0 {
        let _ = write!(line, "{},", entry.detail);
    }
    if item_flags & RECORD_ITEM_ADDR != 0 {
        let _ = write!(line, "0x{:x},", entry.addr);
    }
    if item_flags & RECORD_ITEM_ERRNO != 0 {
        let _ = write!(line, "{},", entry.status_code);
    }
    if item_flags & RECORD_ITEM_STUB != 0 {
        let _ = write!(line, "0x{:x},", entry.stub);
    }
    line.push('\n');
    line
}

pub(crate) fn get_records_text(state: &RecordState, item_flags: u32) -> Option<String> {
    if !state.recordable || state.entries.is_empty() {
        return None;
    }
    let mut output = String::new();
    for entry in &state.entries {
        output.push_str(&format_entry(entry, item_flags));
    }
    Some(output)
}

// 循环写入直到全部字节落盘，处理 short write
pub(crate) fn dump_records_text(fd: i32, text: &str) -> Result<(), Errno> {
    if fd < 0 {
        return Err(Errno::InvalidArg);
    }
    let bytes = text.as_bytes();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let written = unsafe {
            libc::write(
                fd,
                bytes[offset..].as_ptr() as *const libc::c_void,
                bytes.len() - offset,
            )
        };
        if written <= 0 {
            return Err(Errno::InstallFailed);
        }
        offset += written as usize;
    }
    Ok(())
}
