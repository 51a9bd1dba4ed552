// 引擎操作错误码，0 表示成功
#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Errno {
    Ok = 0,                 // 成功
    Uninit = 1,             // 引擎未初始化
    InitErrInvalidArg = 2,  // 初始化参数无效
    InitErrMonitor = 3,     // 加载监控线程启动失败
    InvalidArg = 4,         // 参数无效
    NotFound = 5,           // 符号或模块未找到
    ModuleUnloaded = 6,     // 模块已卸载
    AlreadyHooked = 7,      // 目标槽已被安装 hook
    InvalidTarget = 8,      // 目标地址非法或不在任何已注册模块内
    InstallFailed = 9,      // hook 写入失败，目标保持原状
    CapabilityLimited = 10, // 地址空间枚举能力受限
    StorageUnavailable = 11, // 偏好存储读取失败
    GetProt = 12,           // 读取内存保护属性失败
    SetProt = 13,           // 设置内存保护属性失败
    SlotVerify = 14,        // 槽写入后校验失败
    BadMaps = 15,           // /proc/self/maps 解析失败
    ReadElf = 16,           // 读取 ELF 信息失败
    Dup = 17,               // 重复操作
    Sealed = 18,            // 安装阶段已结束，拒绝注册
}

impl Errno {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<Errno> for i32 {
    fn from(value: Errno) -> Self {
        value as i32
    }
}
