use crate::HookError;
use crate::protect::page_size;

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE, c_void};
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};

const MAX_ATTEMPTS: usize = 64;

/// One executable page that lives close enough to a hooked function for
/// `rel32` jumps and rip-relative operands to reach across.
pub(super) struct NearPage {
    pub addr: usize,
    pub len: usize,
}

impl Drop for NearPage {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.addr as *mut c_void, self.len) };
    }
}

impl NearPage {
    pub fn allocate(target: usize) -> Result<Self, HookError> {
        let len = page_size();
        let bound = Bound::new(target as u64);
        let regions = read_self_mem_layout()?;
        for hint in candidates(&regions, target as u64, &bound, len as u64)
            .into_iter()
            .take(MAX_ATTEMPTS)
        {
            let mem = unsafe {
                libc::mmap(
                    hint as *mut c_void,
                    len,
                    PROT_READ | PROT_WRITE | PROT_EXEC,
                    MAP_PRIVATE | MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if mem == MAP_FAILED {
                continue;
            }
            let addr = mem as u64;
            if bound.contains(addr) {
                return Ok(Self {
                    addr: addr as usize,
                    len,
                });
            }
            // the kernel ignored the hint
            unsafe { libc::munmap(mem, len) };
        }
        Err(HookError::MemorySearching)
    }
}

/// How many bytes of executable mapping start at `addr`, if it is executable
/// at all.
pub(super) fn executable_len(addr: usize) -> Option<usize> {
    let regions = read_self_mem_layout().ok()?;
    regions
        .iter()
        .find(|r| r.contains(addr as u64))
        .filter(|r| r.prot & PROT_EXEC != 0)
        .map(|r| (r.end - addr as u64) as usize)
}

/// The current protection of each page in `pages`.
///
/// Fails with `ENOMEM`, as `mprotect` would, when a page is not mapped.
pub(crate) fn protections(pages: impl Iterator<Item = usize>) -> Result<Vec<(usize, i32)>, HookError> {
    let regions = read_self_mem_layout()?;
    pages
        .map(|page| {
            regions
                .iter()
                .find(|r| r.contains(page as u64))
                .map(|r| (page, r.prot))
                .ok_or(HookError::MemoryProtect(libc::ENOMEM as u32))
        })
        .collect()
}

struct Region {
    start: u64,
    end: u64,
    prot: i32,
}

impl Region {
    fn contains(&self, addr: u64) -> bool {
        (self.start..self.end).contains(&addr)
    }
}

fn parse_prot(perms: &[u8]) -> i32 {
    [(b'r', PROT_READ), (b'w', PROT_WRITE), (b'x', PROT_EXEC)]
        .iter()
        .zip(perms)
        .filter(|((flag, _), c)| *c == flag)
        .fold(libc::PROT_NONE, |prot, ((_, bit), _)| prot | bit)
}

fn read_self_mem_layout() -> Result<Vec<Region>, HookError> {
    let re = Regex::new(r"^([0-9a-f]+)-([0-9a-f]+)\s+(\S{4})").map_err(|_| HookError::MemorySearching)?;
    let maps = File::open("/proc/self/maps")?;
    let mut regions = vec![];
    for line in BufReader::new(maps).lines() {
        let line = line?;
        let Some(caps) = re.captures(&line) else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(&caps[1], 16),
            u64::from_str_radix(&caps[2], 16),
        ) else {
            continue;
        };
        regions.push(Region {
            start,
            end,
            prot: parse_prot(caps[3].as_bytes()),
        });
    }
    Ok(regions)
}

/// Page addresses in the unmapped gaps of `regions`, nearest to `target` first.
fn candidates(regions: &[Region], target: u64, bound: &Bound, page: u64) -> Vec<u64> {
    let mut gaps = vec![];
    let mut prev_end = page;
    for r in regions {
        if r.start > prev_end {
            gaps.push((prev_end, r.start));
        }
        prev_end = prev_end.max(r.end);
    }
    if prev_end < bound.max {
        gaps.push((prev_end, bound.max));
    }
    let mut hints: Vec<u64> = gaps
        .into_iter()
        .filter_map(|(start, end)| {
            let lo = start.max(bound.min.next_multiple_of(page));
            let hi = end.min(bound.max).saturating_sub(page) & !(page - 1);
            if lo > hi {
                return None;
            }
            // the page of the gap closest to the target
            Some(if target <= lo {
                lo
            } else if target >= hi {
                hi
            } else {
                target & !(page - 1)
            })
        })
        .collect();
    hints.sort_by_key(|h| h.abs_diff(target));
    hints
}

struct Bound {
    min: u64,
    max: u64,
}

impl Bound {
    fn new(init_addr: u64) -> Self {
        if cfg!(target_pointer_width = "64") {
            Self {
                min: init_addr.saturating_sub(i32::MAX as u64),
                max: init_addr.saturating_add(i32::MAX as u64),
            }
        } else {
            Self {
                min: 0,
                max: u32::MAX as u64,
            }
        }
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.min && addr < self.max
    }
}
