// Crate-wide prelude. Every module in this crate starts with `use crate::common::*;`.

pub(crate) use std::{
  cmp::Ordering,
  collections::HashMap,
  fmt,
  net::{Ipv4Addr, SocketAddrV4},
  sync::{
    atomic::{AtomicBool, Ordering as AtomicOrdering},
    mpsc, Arc, Mutex,
  },
  thread,
  time::{Duration, Instant},
};

pub(crate) use log::{debug, error, info, trace, warn};
pub(crate) use snafu::{ResultExt, Snafu};

pub use crate::error::Error;
pub(crate) use crate::error;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
