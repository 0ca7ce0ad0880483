use std::{fmt, ops};

/// The readiness interest mask carried by every registered handle: which of
/// readable / writable / error / hangup the engine currently wants to hear
/// about for that handle, and which of them fired on a given wakeup.
///
/// No edge- vs level-triggered distinction and no oneshot mode: the
/// readiness loop is a single straight pass over whatever `epoll_wait`
/// returns each iteration, so every registration is plain level-triggered.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interest(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;
const ALL: usize = READABLE | WRITABLE | ERROR | HUP;

impl Interest {
    #[inline]
    pub fn empty() -> Interest {
        Interest(0)
    }

    #[inline]
    pub fn readable() -> Interest {
        Interest(READABLE)
    }

    #[inline]
    pub fn writable() -> Interest {
        Interest(WRITABLE)
    }

    #[inline]
    pub fn error() -> Interest {
        Interest(ERROR)
    }

    #[inline]
    pub fn hup() -> Interest {
        Interest(HUP)
    }

    /// `{error, hangup}` only — what `SENT_TOKEN` and `DIFF_BACK` wait on
    /// once they no longer expect to read or write.
    #[inline]
    pub fn error_hup() -> Interest {
        Interest(ERROR | HUP)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(&self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Interest::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Interest::writable())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Interest::error())
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Interest::hup())
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl ops::BitAnd for Interest {
    type Output = Interest;

    #[inline]
    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl ops::Sub for Interest {
    type Output = Interest;

    #[inline]
    fn sub(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl ops::Not for Interest {
    type Output = Interest;

    #[inline]
    fn not(self) -> Interest {
        Interest(!self.0 & ALL)
    }
}

impl From<usize> for Interest {
    fn from(bits: usize) -> Interest {
        Interest(bits)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (Interest::readable(), "Readable"),
            (Interest::writable(), "Writable"),
            (Interest::error(), "Error"),
            (Interest::hup(), "Hup"),
        ];

        write!(fmt, "Interest {{")?;

        let mut first = true;
        for &(flag, name) in &flags {
            if self.contains(flag) {
                if !first {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                first = false;
            }
        }

        write!(fmt, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_query() {
        let i = Interest::readable() | Interest::writable();
        assert!(i.is_readable());
        assert!(i.is_writable());
        assert!(!i.is_error());
    }

    #[test]
    fn error_hup_excludes_io() {
        let i = Interest::error_hup();
        assert!(!i.is_readable());
        assert!(!i.is_writable());
        assert!(i.is_error());
        assert!(i.is_hup());
    }

    #[test]
    fn subtraction_removes_bits() {
        let i = Interest::readable() | Interest::writable();
        let j = i - Interest::writable();
        assert!(j.is_readable());
        assert!(!j.is_writable());
    }
}
