use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, EnvFilter, Layer};

#[derive(Clone, Debug, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum LogOutput {
    #[default]
    Console,
    Json,
    None,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Also append logs, without ANSI colors, to this file.
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    /// Installs the global subscriber. `RUST_LOG` overrides the level.
    pub fn init(self) -> anyhow::Result<()> {
        use tracing_subscriber::layer::SubscriberExt;

        let subscriber = tracing_subscriber::registry().with(self.layers()?);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }

    fn filter(&self) -> anyhow::Result<EnvFilter> {
        // http client chatter from checkpoint downloads
        let quiet: [Directive; 2] = ["ureq=warn".parse()?, "hf_hub=warn".parse()?];
        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;
        Ok(quiet
            .into_iter()
            .fold(filter, |filter, directive| filter.add_directive(directive)))
    }

    #[allow(clippy::type_complexity)]
    fn layers(
        &self,
    ) -> anyhow::Result<Vec<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>>> {
        let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

        match self.output {
            LogOutput::Console => layers.push(
                fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_filter(self.filter()?)
                    .boxed(),
            ),
            LogOutput::Json => layers.push(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stdout)
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_filter(self.filter()?)
                    .boxed(),
            ),
            LogOutput::None => {}
        }

        if let Some(log_file_path) = &self.write_logs_file {
            let log_file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_file_path)?;

            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_filter(self.filter()?)
                    .boxed(),
            );
        }

        Ok(layers)
    }
}

pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}
