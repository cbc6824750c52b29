//! Size classes for the segregated free lists

/// Size classes, selected by block size (tags included)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum SizeClass {
    UpTo256 = 0,
    UpTo512 = 1,
    UpTo1024 = 2,
    Larger = 3,
}

impl SizeClass {
    pub const COUNT: usize = 4;

    /// All classes, smallest first
    pub const ALL: [Self; Self::COUNT] = [
        SizeClass::UpTo256,
        SizeClass::UpTo512,
        SizeClass::UpTo1024,
        SizeClass::Larger,
    ];

    /// Select size class from a block size
    pub const fn from_size(size: u32) -> Self {
        match size {
            0..=256 => SizeClass::UpTo256,
            257..=512 => SizeClass::UpTo512,
            513..=1024 => SizeClass::UpTo1024,
            _ => SizeClass::Larger,
        }
    }

    /// Largest block size in this class, `None` for the open-ended class
    pub const fn upper_bound(&self) -> Option<u32> {
        match self {
            SizeClass::UpTo256 => Some(256),
            SizeClass::UpTo512 => Some(512),
            SizeClass::UpTo1024 => Some(1024),
            SizeClass::Larger => None,
        }
    }

    pub const fn to_index(&self) -> usize {
        *self as usize
    }

    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SizeClass::UpTo256),
            1 => Some(SizeClass::UpTo512),
            2 => Some(SizeClass::UpTo1024),
            3 => Some(SizeClass::Larger),
            _ => None,
        }
    }

    /// This class and every larger one, in search order
    pub fn and_larger(self) -> impl Iterator<Item = SizeClass> {
        Self::ALL.into_iter().skip(self.to_index())
    }
}
