//! The five logical I/O channels a child can be wired to

use std::fmt;
use std::ops::{BitOr, BitOrAssign, Index, IndexMut};
use std::os::fd::RawFd;

/// One logical I/O stream of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
    /// Parent writes, child reads on a configurable fd (default 0)
    GenericIn,
    /// Child writes on a configurable fd (default 1), parent reads
    GenericOut,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Stdin,
        Channel::Stdout,
        Channel::Stderr,
        Channel::GenericIn,
        Channel::GenericOut,
    ];

    pub const READABLE: [Channel; 3] = [Channel::GenericOut, Channel::Stdout, Channel::Stderr];

    pub const WRITABLE: [Channel; 2] = [Channel::GenericIn, Channel::Stdin];

    pub fn index(self) -> usize {
        match self {
            Channel::Stdin => 0,
            Channel::Stdout => 1,
            Channel::Stderr => 2,
            Channel::GenericIn => 3,
            Channel::GenericOut => 4,
        }
    }

    /// Parent reads from this channel
    pub fn is_readable(self) -> bool {
        matches!(self, Channel::Stdout | Channel::Stderr | Channel::GenericOut)
    }

    /// Parent writes to this channel
    pub fn is_writable(self) -> bool {
        !self.is_readable()
    }

    /// Child fd of a standard channel
    pub fn fixed_fd(self) -> Option<RawFd> {
        match self {
            Channel::Stdin => Some(0),
            Channel::Stdout => Some(1),
            Channel::Stderr => Some(2),
            Channel::GenericIn | Channel::GenericOut => None,
        }
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Stdin => "stdin",
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
            Channel::GenericIn => "generic-in",
            Channel::GenericOut => "generic-out",
        };
        f.write_str(name)
    }
}

/// Set of requested channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags(u8);

impl ChannelFlags {
    pub const NONE: ChannelFlags = ChannelFlags(0);
    pub const STDIN: ChannelFlags = ChannelFlags(1 << 0);
    pub const STDOUT: ChannelFlags = ChannelFlags(1 << 1);
    pub const STDERR: ChannelFlags = ChannelFlags(1 << 2);
    pub const GENERIC_IN: ChannelFlags = ChannelFlags(1 << 3);
    pub const GENERIC_OUT: ChannelFlags = ChannelFlags(1 << 4);
    pub const STDIO: ChannelFlags = ChannelFlags(0b111);

    pub fn contains(self, channel: Channel) -> bool {
        self.0 & channel.bit() != 0
    }

    pub fn insert(&mut self, channel: Channel) {
        self.0 |= channel.bit();
    }

    pub fn remove(&mut self, channel: Channel) {
        self.0 &= !channel.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Channels that will actually be wired for a run, with their child fds.
    ///
    /// A generic channel whose target fd equals a standard channel's fixed fd
    /// disables that standard channel. Computed at start time, so moving the
    /// generic target away re-enables the standard channel on the next run.
    pub fn resolve(self, generic_in_fd: RawFd, generic_out_fd: RawFd) -> Vec<(Channel, RawFd)> {
        debug_assert!(
            !(self.contains(Channel::GenericIn)
                && self.contains(Channel::GenericOut)
                && generic_in_fd == generic_out_fd),
            "generic channels cannot share child fd {generic_in_fd}"
        );

        let shadowed = |fd: RawFd| {
            (self.contains(Channel::GenericIn) && generic_in_fd == fd)
                || (self.contains(Channel::GenericOut) && generic_out_fd == fd)
        };

        Channel::ALL
            .into_iter()
            .filter(|c| self.contains(*c))
            .filter_map(|c| match c.fixed_fd() {
                Some(fd) if shadowed(fd) => None,
                Some(fd) => Some((c, fd)),
                None if c == Channel::GenericIn => Some((c, generic_in_fd)),
                None => Some((c, generic_out_fd)),
            })
            .collect()
    }
}

impl From<Channel> for ChannelFlags {
    fn from(channel: Channel) -> Self {
        ChannelFlags(channel.bit())
    }
}

impl BitOr for ChannelFlags {
    type Output = ChannelFlags;

    fn bitor(self, rhs: ChannelFlags) -> ChannelFlags {
        ChannelFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChannelFlags {
    fn bitor_assign(&mut self, rhs: ChannelFlags) {
        self.0 |= rhs.0;
    }
}

/// Fixed-size per-channel storage indexed by [`Channel`]
#[derive(Debug, Clone, Default)]
pub struct ChannelMap<T>([T; 5]);

impl<T> ChannelMap<T> {
    pub fn iter(&self) -> impl Iterator<Item = (Channel, &T)> {
        Channel::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<Channel> for ChannelMap<T> {
    type Output = T;

    fn index(&self, channel: Channel) -> &T {
        &self.0[channel.index()]
    }
}

impl<T> IndexMut<Channel> for ChannelMap<T> {
    fn index_mut(&mut self, channel: Channel) -> &mut T {
        &mut self.0[channel.index()]
    }
}
