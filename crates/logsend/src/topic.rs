// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsing of the raw per-topic configuration value.

use std::path::PathBuf;

/// Batch size used when the configuration value omits it or carries an invalid one.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// The files feeding one topic and the batch size configured for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub files: Vec<PathBuf>,
    pub batch_size: usize,
}

impl TopicConfig {
    /// Parses a raw value of the form `"path1,path2,...[:batch]"`.
    ///
    /// Only the text between the first and the second `:` is read as the batch size.
    /// Anything that is not a positive integer falls back to [`DEFAULT_BATCH_SIZE`].
    /// Blank path entries are skipped.
    ///
    /// # Examples
    ///
    /// ```
    /// use logsend::topic::TopicConfig;
    /// use std::path::PathBuf;
    ///
    /// let config = TopicConfig::parse("a.log,b.log:5");
    /// assert_eq!(config.files, vec![PathBuf::from("a.log"), PathBuf::from("b.log")]);
    /// assert_eq!(config.batch_size, 5);
    ///
    /// assert_eq!(TopicConfig::parse("a.log:0").batch_size, 20);
    /// ```
    pub fn parse(raw: &str) -> Self {
        let mut items = raw.split(':');
        let files = items
            .next()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|file| !file.is_empty())
            .map(PathBuf::from)
            .collect();

        let batch_size = items
            .next()
            .and_then(|batch| batch.trim().parse::<i64>().ok())
            .filter(|batch| *batch > 0)
            .and_then(|batch| usize::try_from(batch).ok())
            .unwrap_or(DEFAULT_BATCH_SIZE);

        Self { files, batch_size }
    }
}
