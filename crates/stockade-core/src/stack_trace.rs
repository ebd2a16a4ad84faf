//! Stack traces of stopped tracees
//!
//! Frames are recovered by walking the frame-pointer chain from the
//! thread's registers. When that yields nothing useful (code built without
//! frame pointers), the top of the stack is scanned for words that point
//! into executable file mappings. Addresses are symbolized from
//! `/proc/<tid>/maps` and the ELF symbol tables of the mapped files.

use goblin::elf::Elf;
use goblin::elf::program_header::PT_LOAD;
use memmap2::Mmap;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::{Duration, Instant};

const MAX_FRAMES: usize = 64;
const MAX_THREADS: usize = 32;
const MAX_CACHED_MODULES: usize = 16;
const SCAN_WORDS: usize = 256;
/// Largest distance between two consecutive frame pointers
const MAX_FRAME_SIZE: u64 = 8 << 20;

/// One symbolized return address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub tid: i32,
    pub address: u64,
    pub symbol: Option<String>,
    /// Distance from the start of `symbol`
    pub offset: u64,
    /// File backing the mapping that holds `address`
    pub module: Option<String>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => write!(f, "{symbol}+0x{:x}", self.offset)?,
            None => write!(f, "0x{:x}", self.address)?,
        }
        if let Some(module) = &self.module {
            write!(f, " ({module})")?;
        }
        Ok(())
    }
}

/// Capture frames for every listed thread. Each thread must be in a
/// ptrace stop. Gives up once `budget` is spent.
pub fn capture(tids: &[Pid], budget: Duration) -> Vec<Frame> {
    let deadline = Instant::now() + budget;
    let mut symbolizer = Symbolizer::default();
    let mut frames = Vec::new();

    for &tid in tids.iter().take(MAX_THREADS) {
        if Instant::now() >= deadline {
            tracing::debug!("stack trace budget exhausted");
            break;
        }
        match addresses(tid, deadline) {
            Ok(addrs) => {
                let maps = read_maps(tid);
                frames.extend(
                    addrs
                        .into_iter()
                        .map(|address| symbolizer.symbolize(tid, &maps, address)),
                );
            }
            Err(e) => tracing::debug!(tid = tid.as_raw(), error = %e, "cannot unwind thread"),
        }
    }
    frames
}

#[derive(Debug, Clone, Copy)]
struct Registers {
    pc: u64,
    sp: u64,
    fp: u64,
    /// Link register, aarch64 only
    lr: Option<u64>,
}

fn read_registers(tid: Pid) -> std::io::Result<Registers> {
    // SAFETY: zeroed plain-old-data register block
    let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: (&raw mut regs).cast(),
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };
    // SAFETY: PTRACE_GETREGSET writes at most `iov_len` bytes into `regs`
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid.as_raw(),
            libc::NT_PRSTATUS as usize as *mut libc::c_void,
            &raw mut iov,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }

    #[cfg(target_arch = "x86_64")]
    let regs = Registers {
        pc: regs.rip,
        sp: regs.rsp,
        fp: regs.rbp,
        lr: None,
    };
    #[cfg(target_arch = "aarch64")]
    let regs = Registers {
        pc: regs.pc,
        sp: regs.sp,
        fp: regs.regs[29],
        lr: Some(regs.regs[30]),
    };
    Ok(regs)
}

/// Return addresses of `tid`, innermost first
fn addresses(tid: Pid, deadline: Instant) -> std::io::Result<Vec<u64>> {
    let regs = read_registers(tid)?;
    let mem = File::open(format!("/proc/{tid}/mem"))?;
    let read_word = |addr: u64| -> Option<u64> {
        let mut buf = [0u8; 8];
        mem.read_exact_at(&mut buf, addr).ok()?;
        Some(u64::from_ne_bytes(buf))
    };

    let mut out = vec![regs.pc];
    if let Some(lr) = regs.lr.filter(|&lr| lr != 0 && lr != regs.pc) {
        out.push(lr);
    }

    // Frame record layout is {saved fp, return address} on both targets
    let mut fp = regs.fp;
    while out.len() < MAX_FRAMES && Instant::now() < deadline {
        if fp == 0 || fp % 8 != 0 {
            break;
        }
        let (Some(next), Some(ret)) = (read_word(fp), read_word(fp + 8)) else {
            break;
        };
        if ret == 0 {
            break;
        }
        out.push(ret);
        if next <= fp || next - fp > MAX_FRAME_SIZE {
            break;
        }
        fp = next;
    }

    if out.len() <= 2 {
        let maps = read_maps(tid);
        let mut sp = regs.sp & !7;
        for _ in 0..SCAN_WORDS {
            if out.len() >= MAX_FRAMES {
                break;
            }
            let Some(word) = read_word(sp) else { break };
            if maps.iter().any(|m| m.exec && m.path.is_some() && m.contains(word)) {
                out.push(word);
            }
            sp += 8;
        }
    }
    Ok(out)
}

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub exec: bool,
    pub offset: u64,
    pub path: Option<String>,
}

impl Mapping {
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

fn read_maps(tid: Pid) -> Vec<Mapping> {
    std::fs::read_to_string(format!("/proc/{tid}/maps"))
        .map(|text| parse_maps(&text))
        .unwrap_or_default()
}

/// Parse the text of a `maps` file, skipping malformed lines
#[must_use]
pub fn parse_maps(text: &str) -> Vec<Mapping> {
    text.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_ascii_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.collect::<Vec<_>>().join(" ");

    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        exec: perms.as_bytes().get(2) == Some(&b'x'),
        offset: u64::from_str_radix(offset, 16).ok()?,
        path: path.starts_with('/').then_some(path),
    })
}

#[derive(Debug)]
struct ModuleSymbols {
    /// `(p_offset, p_vaddr, p_filesz)` of each loadable segment
    loads: Vec<(u64, u64, u64)>,
    /// `(address, size, name)`, sorted by address
    functions: Vec<(u64, u64, String)>,
}

impl ModuleSymbols {
    fn load(path: &Path) -> Option<Self> {
        let file = File::open(path).ok()?;
        // SAFETY: read-only private mapping of a file we only parse
        let map = unsafe { Mmap::map(&file) }.ok()?;
        let elf = Elf::parse(&map).ok()?;

        let loads = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| (ph.p_offset, ph.p_vaddr, ph.p_filesz))
            .collect();

        let mut functions: Vec<(u64, u64, String)> = elf
            .syms
            .iter()
            .filter_map(|sym| Some((sym, elf.strtab.get_at(sym.st_name)?)))
            .chain(
                elf.dynsyms
                    .iter()
                    .filter_map(|sym| Some((sym, elf.dynstrtab.get_at(sym.st_name)?))),
            )
            .filter(|(sym, name)| sym.is_function() && sym.st_value != 0 && !name.is_empty())
            .map(|(sym, name)| (sym.st_value, sym.st_size, name.to_string()))
            .collect();
        functions.sort_by_key(|(addr, size, _)| (*addr, std::cmp::Reverse(*size)));
        functions.dedup_by_key(|(addr, _, _)| *addr);

        Some(Self { loads, functions })
    }

    fn file_offset_to_vaddr(&self, file_offset: u64) -> Option<u64> {
        self.loads
            .iter()
            .find(|(off, _, size)| *off <= file_offset && file_offset < off + size)
            .map(|(off, vaddr, _)| file_offset - off + vaddr)
    }

    fn lookup(&self, vaddr: u64) -> Option<(&str, u64)> {
        let idx = self.functions.partition_point(|(addr, _, _)| *addr <= vaddr);
        let (addr, size, name) = self.functions.get(idx.checked_sub(1)?)?;
        let offset = vaddr - addr;
        (*size == 0 || offset < *size).then_some((name.as_str(), offset))
    }
}

#[derive(Debug, Default)]
struct Symbolizer {
    modules: HashMap<String, Option<ModuleSymbols>>,
}

impl Symbolizer {
    fn symbolize(&mut self, tid: Pid, maps: &[Mapping], address: u64) -> Frame {
        let mut frame = Frame {
            tid: tid.as_raw(),
            address,
            symbol: None,
            offset: 0,
            module: None,
        };
        let Some(mapping) = maps.iter().find(|m| m.contains(address)) else {
            return frame;
        };
        let Some(path) = &mapping.path else {
            return frame;
        };
        frame.module = Some(path.clone());

        let file_offset = address - mapping.start + mapping.offset;
        if let Some(module) = self.module(tid, path) {
            if let Some((name, offset)) = module
                .file_offset_to_vaddr(file_offset)
                .and_then(|vaddr| module.lookup(vaddr))
            {
                frame.symbol = Some(name.to_string());
                frame.offset = offset;
            }
        }
        frame
    }

    fn module(&mut self, tid: Pid, path: &str) -> Option<&ModuleSymbols> {
        if !self.modules.contains_key(path) {
            if self.modules.len() >= MAX_CACHED_MODULES {
                return None;
            }
            // The sandboxee may live in its own mount namespace
            let loaded = ModuleSymbols::load(Path::new(&format!("/proc/{tid}/root{path}")))
                .or_else(|| ModuleSymbols::load(Path::new(path)));
            self.modules.insert(path.to_string(), loaded);
        }
        self.modules.get(path)?.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 fd:01 1234                       /usr/bin/sleep
55d0c0a02000-55d0c0a06000 r-xp 00002000 fd:01 1234                       /usr/bin/sleep
7f1e2c000000-7f1e2c021000 rw-p 00000000 00:00 0
7f1e2c228000-7f1e2c3bd000 r-xp 00028000 fd:01 5678                       /usr/lib/x86_64-linux-gnu/libc.so.6
7ffd5b3c1000-7ffd5b3e2000 rw-p 00000000 00:00 0                          [stack]
";

    #[test]
    fn parses_maps() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 5);
        assert!(maps[1].exec);
        assert_eq!(maps[1].offset, 0x2000);
        assert_eq!(maps[1].path.as_deref(), Some("/usr/bin/sleep"));
        assert_eq!(maps[2].path, None);
        assert_eq!(maps[4].path, None);
        assert!(maps[3].contains(0x7f1e_2c22_8000));
        assert!(!maps[3].contains(0x7f1e_2c3b_d000));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_maps("garbage\n-\nzz-yy r-xp 0 0 0\n").is_empty());
    }

    #[test]
    fn frame_display() {
        let frame = Frame {
            tid: 7,
            address: 0xdead,
            symbol: None,
            offset: 0,
            module: None,
        };
        assert_eq!(frame.to_string(), "0xdead");
    }

    #[test]
    fn symbolizes_own_code() {
        let pid = nix::unistd::getpid();
        let maps = read_maps(pid);
        let address = symbolizes_own_code as usize as u64;
        let frame = Symbolizer::default().symbolize(pid, &maps, address);
        assert!(frame.module.is_some());
        if let Some(symbol) = frame.symbol {
            assert!(symbol.contains("symbolizes_own_code"));
            assert_eq!(frame.offset, 0);
        }
    }
}
