use std::io::{self, Write};

use serde::Serialize;

use crate::app::{CheckResult, ConfirmResult, FetchResult, ListResult, SourcesResult};
use crate::progress::size_fmt;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sources(result: &SourcesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_confirm(result: &Option<ConfirmResult>) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Plain text rendering for terminals.
pub struct TextOutput;

impl TextOutput {
    pub fn print_sources(result: &SourcesResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "Sources for {}:", result.platform)?;
        for source in &result.sources {
            writeln!(out, "  {:<32} {}", source.name, source.url)?;
        }
        Ok(())
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{} builds for {}:", result.source, result.platform)?;
        for entry in &result.builds {
            let marker = if entry.installed { '*' } else { ' ' };
            let date = entry.date.as_deref().unwrap_or("unknown date");
            let size = entry.size.map(size_fmt).unwrap_or_default();
            writeln!(
                out,
                "{marker}{:>3}  {:<12} {:<20} {size}",
                entry.index, entry.version, date
            )?;
            if let Some(summary) = &entry.summary {
                writeln!(out, "       {summary}")?;
            }
        }
        if let Some(installed) = &result.installed {
            writeln!(out, "\nInstalled: {installed}")?;
        }
        Ok(())
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        match result.status {
            crate::app::FetchStatus::Cancelled => {
                writeln!(out, "Fetch of {} cancelled", result.build)?;
            }
            crate::app::FetchStatus::Staged => {
                writeln!(out, "Staged {} from {}:", result.build, result.source)?;
                for file in &result.files {
                    writeln!(out, "  {file}")?;
                }
                if result.verified == Some(true) {
                    writeln!(out, "Checksums verified.")?;
                }
                if let Some(warning) = &result.archive_warning {
                    writeln!(out, "Warning: {warning}")?;
                }
                writeln!(out, "Reboot to install the update.")?;
            }
        }
        Ok(())
    }

    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "Installed: {}", result.installed)?;
        match &result.latest {
            Some(latest) if result.newer_available => {
                writeln!(out, "A newer build is available from {}: {latest}", result.source)?
            }
            Some(latest) => writeln!(out, "Up to date (latest from {}: {latest})", result.source)?,
            None => writeln!(out, "{} lists no builds", result.source)?,
        }
        if result.pending_update {
            writeln!(out, "An update is staged and will be installed on the next reboot")?;
        }
        Ok(())
    }

    pub fn print_confirm(result: &Option<ConfirmResult>) -> io::Result<()> {
        let mut out = io::stdout().lock();
        match result {
            None => writeln!(out, "No pending installation to confirm")?,
            Some(result) if result.succeeded => {
                writeln!(out, "Build {} from {} is installed", result.installed, result.source)?
            }
            Some(result) => writeln!(
                out,
                "Installation failed: expected {} but {} is running",
                result.expected, result.installed
            )?,
        }
        Ok(())
    }
}
