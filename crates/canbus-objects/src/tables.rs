//! Value tables for table-backed properties. On the bus a property is
//! exchanged as its index in the table.

pub const BOOLEAN: &[&str] = &["false", "true"];

pub const INPUT_DEVICE: &[&str] = &["keyboard", "can", "ttya", "ttyb"];

pub const OUTPUT_DEVICE: &[&str] = &["screen", "can", "ttya", "ttyb"];

pub const BOOT_DEVICE: &[&str] = &[
    "", "elan", "disk", "net", "disk0", "disk1", "disk2", "disk3", "can", "eip",
];

/// A property name paired with its value table.
#[derive(Debug, Clone, Copy)]
pub struct TableProperty {
    pub name: &'static str,
    pub table: &'static [&'static str],
}

impl TableProperty {
    pub const fn new(name: &'static str, table: &'static [&'static str]) -> Self {
        Self { name, table }
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.table
            .iter()
            .position(|v| *v == value)
            .map(|i| i as u32)
    }

    pub fn value_at(&self, index: u32) -> Option<&'static str> {
        self.table.get(index as usize).copied()
    }
}
