use std::fmt;

/// Relinearization class of a degree of freedom or a cell.
///
/// The numeric values are significant: colors are reconciled across process borders by
/// taking the minimum or maximum code, and a smaller code always means more work.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EntityColor {
    /// Needs to be relinearized because its error is above the tolerance.
    Red = 0,
    /// Needs to be relinearized because a neighboring entity is red.
    Yellow = 1,
    /// A yellow degree of freedom which only has non-green neighbor cells.
    ///
    /// Its error is below the tolerance, but it can be relinearized without additional cost.
    /// Only used while colors are being computed and never visible afterwards.
    Orange = 2,
    /// Does not need to be relinearized.
    Green = 3,
}

impl EntityColor {
    /// The code used to communicate the color to other processes.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Red),
            1 => Some(Self::Yellow),
            2 => Some(Self::Orange),
            3 => Some(Self::Green),
            _ => None,
        }
    }
}

impl fmt::Display for EntityColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Orange => "orange",
            Self::Green => "green",
        };
        write!(f, "{}", name)
    }
}
