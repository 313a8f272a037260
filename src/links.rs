use std::fs::File;
use std::io;
use std::sync::Arc;

use libbpf_rs::ProgramMut;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::kallsyms;
use crate::uprobe::AttachTarget;
use crate::uprobe::Pid;
use crate::uprobe::ProbeLink;
use crate::uprobe::Registry;
use crate::uprobe::Uprobe;
use crate::uprobe::UprobeConfig;
use crate::uprobe::UprobeError;
use crate::uprobe::UprobeOptions;

/// Scheduler switch is where wall time gets accounted. The symbol is
/// frequently cloned by the compiler, so candidates come from kallsyms.
pub const WALL_TIME_KPROBE: &str = "finish_task_switch";

const SIGNAL_TRACEPOINT_CATEGORY: &str = "signal";
const SIGNAL_TRACEPOINT_NAME: &str = "signal_deliver";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to read kernel symbols")]
    Kallsyms(#[source] io::Error),
    #[error("no kernel symbol candidates for {0}")]
    NoKprobeCandidates(String),
    #[error("failed to attach kprobe to {name}")]
    Kprobe {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to attach tracepoint {category}:{name}")]
    Tracepoint {
        category: String,
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Uprobe(#[from] UprobeError),
    #[error("failed to detach tracer link")]
    Detach {
        #[source]
        source: anyhow::Error,
    },
}

pub trait KprobeTarget {
    fn attach_kprobe_at(&self, name: &str) -> anyhow::Result<Box<dyn ProbeLink>>;
}

pub trait TracepointTarget {
    fn attach_tracepoint_at(
        &self,
        category: &str,
        name: &str,
    ) -> anyhow::Result<Box<dyn ProbeLink>>;
}

impl KprobeTarget for ProgramMut<'_> {
    fn attach_kprobe_at(&self, name: &str) -> anyhow::Result<Box<dyn ProbeLink>> {
        let link = self.attach_kprobe(false, name)?;
        Ok(Box::new(link))
    }
}

impl TracepointTarget for ProgramMut<'_> {
    fn attach_tracepoint_at(
        &self,
        category: &str,
        name: &str,
    ) -> anyhow::Result<Box<dyn ProbeLink>> {
        let link = self.attach_tracepoint(category, name)?;
        Ok(Box::new(link))
    }
}

/// The loaded tracer programs the link set attaches.
pub struct TracerPrograms<'a> {
    pub wall_time: &'a dyn KprobeTarget,
    pub signal_deliver: &'a dyn TracepointTarget,
    pub uprobe: &'a dyn AttachTarget,
}

pub struct UprobeTarget {
    pub config: UprobeConfig,
    pub pid: Option<Pid>,
}

#[derive(Default)]
pub struct LinksConfig {
    pub trace_wall_time: bool,
    pub trace_signals: bool,
    pub uprobes: Vec<UprobeTarget>,
}

/// Every kernel attachment the agent holds. Links stay attached until
/// `close` is called.
pub struct LinkSet {
    wall_time: Option<Box<dyn ProbeLink>>,
    signal_deliver: Option<Box<dyn ProbeLink>>,
    uprobes: Vec<Box<dyn Uprobe>>,
}

impl LinkSet {
    /// Attaches every tracer named in `config`. If any attachment fails,
    /// everything attached so far is closed before the error is returned.
    pub fn setup(
        registry: &Arc<Registry>,
        programs: TracerPrograms<'_>,
        config: &LinksConfig,
    ) -> Result<Self, LinkError> {
        let mut links = Self {
            wall_time: None,
            signal_deliver: None,
            uprobes: Vec::new(),
        };
        if let Err(err) = links.setup_inner(registry, programs, config) {
            if let Err(close_err) = links.close() {
                warn!(
                    "failed to clean up links after partial setup: {:?}",
                    close_err
                );
            }
            return Err(err);
        }
        Ok(links)
    }

    fn setup_inner(
        &mut self,
        registry: &Arc<Registry>,
        programs: TracerPrograms<'_>,
        config: &LinksConfig,
    ) -> Result<(), LinkError> {
        if config.trace_wall_time {
            let kallsyms =
                File::open(kallsyms::KALLSYMS_PATH).map_err(LinkError::Kallsyms)?;
            let candidates = kallsyms::kprobe_candidates(kallsyms, WALL_TIME_KPROBE);
            self.wall_time = Some(attach_kprobe_candidates(
                programs.wall_time,
                WALL_TIME_KPROBE,
                &candidates,
            )?);
        }
        if config.trace_signals {
            let link = programs
                .signal_deliver
                .attach_tracepoint_at(SIGNAL_TRACEPOINT_CATEGORY, SIGNAL_TRACEPOINT_NAME)
                .map_err(|source| LinkError::Tracepoint {
                    category: SIGNAL_TRACEPOINT_CATEGORY.to_string(),
                    name: SIGNAL_TRACEPOINT_NAME.to_string(),
                    source,
                })?;
            debug!(
                "attached tracepoint {}:{}",
                SIGNAL_TRACEPOINT_CATEGORY, SIGNAL_TRACEPOINT_NAME
            );
            self.signal_deliver = Some(link);
        }
        for target in &config.uprobes {
            let mut uprobe =
                registry.create(target.config.clone(), UprobeOptions { pid: target.pid });
            uprobe.attach(programs.uprobe)?;
            self.uprobes.push(uprobe);
        }
        Ok(())
    }

    /// Detaches everything. Safe to call more than once. Every link is given
    /// a chance to close; the first error is the one returned.
    pub fn close(&mut self) -> Result<(), LinkError> {
        let mut first_error: Option<LinkError> = None;
        for link in self
            .wall_time
            .take()
            .into_iter()
            .chain(self.signal_deliver.take())
        {
            if let Err(source) = link.close() {
                error!("failed to detach tracer link: {:?}", source);
                if first_error.is_none() {
                    first_error = Some(LinkError::Detach { source });
                }
            }
        }
        for mut uprobe in self.uprobes.drain(..) {
            if let Err(err) = uprobe.close() {
                error!("failed to close uprobe: {:?}", err);
                if first_error.is_none() {
                    first_error = Some(LinkError::Uprobe(err));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn attach_kprobe_candidates(
    target: &dyn KprobeTarget,
    symbol: &str,
    candidates: &[String],
) -> Result<Box<dyn ProbeLink>, LinkError> {
    let mut last_error = None;
    for name in candidates {
        match target.attach_kprobe_at(name) {
            Ok(link) => {
                debug!("attached kprobe to {}", name);
                return Ok(link);
            }
            Err(source) => {
                warn!("failed to attach kprobe to {}: {:?}", name, source);
                last_error = Some(source);
            }
        }
    }
    match last_error {
        Some(source) => Err(LinkError::Kprobe {
            name: symbol.to_string(),
            source,
        }),
        None => Err(LinkError::NoKprobeCandidates(symbol.to_string())),
    }
}
