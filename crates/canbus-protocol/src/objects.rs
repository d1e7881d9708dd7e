//! Well-known object ids.

/// Console data stream; DAT packets to a node's console go here.
pub const CONSOLE_DATA: u16 = 0x000;
pub const HEARTBEAT: u16 = 0x031;
pub const IAM: u16 = 0x076;

/// Per-session console objects are allocated from this range.
pub const CONSOLE_MIN: u16 = 0x100;
pub const CONSOLE_MAX: u16 = 0x1ff;

pub const ETHERNET_ID: u16 = 0x3d8;
pub const HOST_ID: u16 = 0x3d9;
pub const SERIAL_NO: u16 = 0x3da;
pub const MEM_SIZE: u16 = 0x3db;
pub const NODE_NO: u16 = 0x3dc;
pub const MODULE_NO: u16 = 0x3dd;
pub const CLUSTER_NO: u16 = 0x3de;
pub const NPROCS: u16 = 0x3e0;
pub const PROC_TYPE: u16 = 0x3e1;
pub const MEM_SIZE_2: u16 = 0x3e2;
pub const AUTOBOOT: u16 = 0x3e3;
pub const BOOT: u16 = 0x3e4;
pub const REMOTE_TEST: u16 = 0x3e5;
pub const CACHE_SIZE: u16 = 0x3e6;
pub const FORCE_DISCONN: u16 = 0x3ef;
pub const CONSOLE_CONNECT: u16 = 0x3f0;
pub const CONSOLE_DISCONN: u16 = 0x3f1;
pub const RESET_IO: u16 = 0x3f2;
pub const BREAK: u16 = 0x3f3;
pub const BOOT_DEV: u16 = 0x3f4;
pub const BOOT_FILE: u16 = 0x3f5;
pub const TESTRW: u16 = 0x3ff;

/// Payload of a reset request: pulse the reset line.
pub const RESET_PULSE: u32 = 2;

/// Names always known without an object file.
pub const BUILTIN: &[(u16, &str)] = &[
    (HEARTBEAT, "HEARTBEAT"),
    (IAM, "IAM"),
    (ETHERNET_ID, "ETHERNETID"),
    (HOST_ID, "HOSTID"),
    (SERIAL_NO, "SERIALNO"),
    (MEM_SIZE, "MEMSIZE"),
    (NODE_NO, "NODENO"),
    (MODULE_NO, "MODULENO"),
    (CLUSTER_NO, "CLUSTERNO"),
    (NPROCS, "NPROCS"),
    (PROC_TYPE, "PROC_TYPE"),
    (MEM_SIZE_2, "MEMSIZE_2"),
    (AUTOBOOT, "AUTOBOOT"),
    (BOOT, "BOOT"),
    (REMOTE_TEST, "REMOTE_TEST"),
    (CACHE_SIZE, "CACHE_SIZE"),
    (FORCE_DISCONN, "FORCE_DISCONN"),
    (CONSOLE_CONNECT, "CONSOLE_CONNECT"),
    (CONSOLE_DISCONN, "CONSOLE_DISCONN"),
    (RESET_IO, "RESET_IO"),
    (BREAK, "BREAK"),
    (BOOT_DEV, "BOOT_DEV"),
    (BOOT_FILE, "BOOT_FILE"),
    (TESTRW, "TESTRW"),
];

pub fn is_console_object(id: u16) -> bool {
    (CONSOLE_MIN..=CONSOLE_MAX).contains(&id)
}

pub fn builtin_name(id: u16) -> Option<&'static str> {
    BUILTIN.iter().find(|(i, _)| *i == id).map(|(_, n)| *n)
}

pub fn builtin_id(name: &str) -> Option<u16> {
    BUILTIN
        .iter()
        .find(|(_, n)| n.eq_ignore_ascii_case(name))
        .map(|(i, _)| *i)
}
