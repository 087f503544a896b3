use core::sync::atomic::{AtomicI64, Ordering};
use log::warn;

// Runtime options, read from the environment (`HALLOC_<NAME>`) on first use.

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum OptionKey {
    ShowStats = 0,
    Verbose = 1,
    PageReset = 2,
    CacheReset = 3,
}

const OPTION_UNINIT: i64 = i64::min_value();

struct OptionDesc {
    value: AtomicI64,
    default: i64,
    env: &'static str, // NUL terminated for `getenv`
}

static OPTIONS: [OptionDesc; 4] = [
    OptionDesc { value: AtomicI64::new(OPTION_UNINIT), default: 0, env: "HALLOC_SHOW_STATS\0" },
    OptionDesc { value: AtomicI64::new(OPTION_UNINIT), default: 0, env: "HALLOC_VERBOSE\0" },
    OptionDesc { value: AtomicI64::new(OPTION_UNINIT), default: 0, env: "HALLOC_PAGE_RESET\0" },
    OptionDesc { value: AtomicI64::new(OPTION_UNINIT), default: 1, env: "HALLOC_CACHE_RESET\0" },
];

// Read `name` from the process environment into `buf`, returning the value
// length, or `None` when unset (or too long to care about).
fn getenv_raw(name: &str, buf: &mut [u8]) -> Option<usize> {
    #[cfg(not(windows))]
    {
        let p = unsafe { libc::getenv(name.as_ptr() as *const libc::c_char) };
        if p.is_null() {
            return None;
        }
        let mut len = 0;
        while len < buf.len() {
            let c = unsafe { *p.add(len) as u8 };
            if c == 0 {
                return Some(len);
            }
            buf[len] = c;
            len += 1;
        }
        None
    }
    #[cfg(windows)]
    {
        let n = unsafe {
            winapi::um::processenv::GetEnvironmentVariableA(
                name.as_ptr() as *const i8,
                buf.as_mut_ptr() as *mut i8,
                buf.len() as u32,
            )
        };
        if n == 0 || n as usize >= buf.len() {
            None
        } else {
            Some(n as usize)
        }
    }
}

fn parse_option(desc: &OptionDesc) -> i64 {
    let mut buf = [0u8; 64];
    let len = match getenv_raw(desc.env, &mut buf) {
        Some(len) => len,
        None => return desc.default,
    };
    let val = &buf[..len];
    let matches = |s: &[u8], w: &str| {
        s.len() == w.len()
            && s.iter().zip(w.bytes()).all(|(&a, b)| a.to_ascii_lowercase() == b)
    };
    if len == 0 || matches(val, "1") || matches(val, "true") || matches(val, "on") || matches(val, "yes") {
        return 1;
    }
    if matches(val, "0") || matches(val, "false") || matches(val, "off") || matches(val, "no") {
        return 0;
    }
    // accept a plain decimal number
    let mut n: i64 = 0;
    for &c in val {
        if !c.is_ascii_digit() {
            warn!("unrecognized value for option {}", &desc.env[..desc.env.len() - 1]);
            return desc.default;
        }
        n = n.saturating_mul(10).saturating_add((c - b'0') as i64);
    }
    n
}

pub fn option_get(key: OptionKey) -> i64 {
    let desc = &OPTIONS[key as usize];
    let v = desc.value.load(Ordering::Relaxed);
    if v != OPTION_UNINIT {
        return v;
    }
    let parsed = parse_option(desc);
    desc.value.store(parsed, Ordering::Relaxed);
    parsed
}

#[inline]
pub fn option_is_enabled(key: OptionKey) -> bool {
    option_get(key) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        std::env::remove_var("HALLOC_PAGE_RESET");
        assert_eq!(option_get(OptionKey::PageReset), 0);
        assert!(option_is_enabled(OptionKey::CacheReset));
    }
}
