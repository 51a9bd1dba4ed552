// /proc/self/maps 解析，提供基于文件映射的镜像枚举
use std::collections::BTreeMap;
use std::fs;

// 单行 maps 记录中与镜像相关的字段
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct MapsSegment {
    pub(super) pathname: String,
    pub(super) start: usize,
    pub(super) end: usize,
    pub(super) offset: usize,
    pub(super) executable: bool,
}

// 聚合后的单个镜像映射范围
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct MapsModule {
    pub(super) pathname: String,
    pub(super) base_addr: usize,
    pub(super) end_addr: usize,
}

pub(super) fn enumerate_modules_maps() -> Option<Vec<MapsModule>> {
    let content = fs::read_to_string("/proc/self/maps").ok()?;
    Some(aggregate_modules(
        content.lines().filter_map(parse_maps_line),
    ))
}

// 按 pathname 聚合各段，仅保留至少含一个可执行段的文件映射
// base 取 offset=0 段的起始地址，范围取所有段的最小起始/最大结束
pub(super) fn aggregate_modules(
    segments: impl IntoIterator<Item = MapsSegment>,
) -> Vec<MapsModule> {
    struct Span {
        base: Option<usize>,
        start: usize,
        end: usize,
        executable: bool,
    }

    let mut spans = BTreeMap::<String, Span>::new();
    for segment in segments {
        let span = spans.entry(segment.pathname.clone()).or_insert(Span {
            base: None,
            start: segment.start,
            end: segment.end,
            executable: false,
        });
        span.start = span.start.min(segment.start);
        span.end = span.end.max(segment.end);
        span.executable |= segment.executable;
        if segment.offset == 0 && span.base.is_none() {
            span.base = Some(segment.start);
        }
    }

    spans
        .into_iter()
        .filter(|(_, span)| span.executable)
        .map(|(pathname, span)| MapsModule {
            pathname,
            base_addr: span.base.unwrap_or(span.start),
            end_addr: span.end,
        })
        .collect()
}

// 解析单行 maps 记录，仅保留可读的文件映射
pub(super) fn parse_maps_line(line: &str) -> Option<MapsSegment> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let pathname = fields.next()?;

    if !pathname.starts_with('/') {
        return None;
    }
    if !perms.starts_with('r') {
        return None;
    }

    let offset = usize::from_str_radix(offset, 16).ok()?;
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    if end <= start {
        return None;
    }

    Some(MapsSegment {
        pathname: pathname.to_string(),
        start,
        end,
        offset,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
    })
}

#[cfg(test)]
mod tests {
    use super::{MapsSegment, aggregate_modules, parse_maps_line};

    #[test]
    fn parse_maps_line_keeps_readable_file_mappings() {
        let segment = parse_maps_line(
            "7f1a2b000000-7f1a2b040000 r-xp 00000000 103:05 123456 /usr/lib/libfoo.so",
        )
        .unwrap();
        assert_eq!(segment.pathname, "/usr/lib/libfoo.so");
        assert_eq!(segment.start, 0x7f1a_2b00_0000);
        assert_eq!(segment.end, 0x7f1a_2b04_0000);
        assert_eq!(segment.offset, 0);
        assert!(segment.executable);
    }

    #[test]
    fn parse_maps_line_skips_anonymous_and_unreadable() {
        assert!(parse_maps_line("7f1a2b000000-7f1a2b040000 r--p 00000000 00:00 0").is_none());
        assert!(
            parse_maps_line("7f1a2b000000-7f1a2b040000 ---p 00000000 103:05 1 /usr/lib/libfoo.so")
                .is_none()
        );
        assert!(parse_maps_line("7f1a2b000000-7f1a2b040000 rw-p 00000000 00:00 0 [stack]").is_none());
    }

    #[test]
    fn aggregate_modules_merges_segments_of_one_image() {
        let segments = vec![
            MapsSegment {
                pathname: "/usr/lib/libfoo.so".to_string(),
                start: 0x1000,
                end: 0x2000,
                offset: 0,
                executable: false,
            },
            MapsSegment {
                pathname: "/usr/lib/libfoo.so".to_string(),
                start: 0x2000,
                end: 0x5000,
                offset: 0x1000,
                executable: true,
            },
        ];
        let modules = aggregate_modules(segments);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].base_addr, 0x1000);
        assert_eq!(modules[0].end_addr, 0x5000);
    }

    #[test]
    fn aggregate_modules_drops_data_only_mappings() {
        let segments = vec![MapsSegment {
            pathname: "/usr/share/fonts/data.bin".to_string(),
            start: 0x1000,
            end: 0x2000,
            offset: 0,
            executable: false,
        }];
        assert!(aggregate_modules(segments).is_empty());
    }
}
