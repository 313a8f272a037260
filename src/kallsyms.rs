use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Lines;
use std::io::Read;

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

#[derive(Debug, PartialEq)]
pub struct Ksym {
    pub start_addr: u64,
    pub symbol_name: String,
}

/// Streams text symbols out of a kallsyms-formatted reader. Local symbols
/// are kept, kprobes attach to those too.
pub struct KsymIter<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: Read> KsymIter<R> {
    pub fn new(data: R) -> Self {
        Self {
            lines: BufReader::new(data).lines(),
        }
    }
}

impl KsymIter<File> {
    pub fn from_kallsyms() -> io::Result<Self> {
        Ok(Self::new(File::open(KALLSYMS_PATH)?))
    }
}

impl<R: Read> Iterator for KsymIter<R> {
    type Item = Ksym;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                _ => return None,
            };

            let mut fields = line.split(' ');
            let (Some(addr), Some(kind), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !matches!(kind, "T" | "t" | "W" | "w") {
                continue;
            }
            let Ok(start_addr) = u64::from_str_radix(addr, 16) else {
                continue;
            };

            return Some(Ksym {
                start_addr,
                symbol_name: name.to_string(),
            });
        }
    }
}

/// Kernel symbols a kprobe for `symbol` can attach to: the symbol itself or
/// a compiler-suffixed clone like `finish_task_switch.isra.0`.
pub fn kprobe_candidates<R: Read>(data: R, symbol: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    for ksym in KsymIter::new(data) {
        if is_instance_of(&ksym.symbol_name, symbol) && !candidates.contains(&ksym.symbol_name) {
            candidates.push(ksym.symbol_name);
        }
    }
    // Undecorated symbol first.
    candidates.sort_by_key(|name| name.len());
    candidates
}

fn is_instance_of(name: &str, symbol: &str) -> bool {
    match name.strip_prefix(symbol) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}
