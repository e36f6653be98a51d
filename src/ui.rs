//! Terminal output for the `ctxstore` binary

use owo_colors::{OwoColorize, Style};
use std::sync::OnceLock;
use tabled::{Table, Tabled, settings::Style as TableStyle};
use crate::storage::StoreStats;

static THEME: OnceLock<Theme> = OnceLock::new();

pub struct Icons;

impl Icons {
    pub const CHECK: &str = "✅";
    pub const CROSS: &str = "❌";
    pub const WARN: &str = "⚠️";
    pub const INFO: &str = "ℹ️";
    pub const DATABASE: &str = "🗄️";
    pub const DEL: &str = "🗑️";
}

#[derive(Debug, Clone)]
pub struct Theme {
    pub header: Style,
    pub success: Style,
    pub error: Style,
    pub warn: Style,
    pub dim: Style,
}

impl Theme {
    pub fn detect() -> Self {
        if !console::Term::stdout().is_term() {
            return Self::plain();
        }
        Self {
            header: Style::new().cyan().bold(),
            success: Style::new().green().bold(),
            error: Style::new().red().bold(),
            warn: Style::new().yellow().bold(),
            dim: Style::new().bright_black(),
        }
    }

    pub fn plain() -> Self {
        Self {
            header: Style::new(),
            success: Style::new(),
            error: Style::new(),
            warn: Style::new(),
            dim: Style::new(),
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}

pub fn section(title: &str) {
    println!();
    println!("{} {}", Icons::DATABASE, title.style(theme().header.clone()));
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().success.clone()));
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(theme().error.clone()));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(theme().warn.clone()));
}

pub fn info(label: &str, value: &str) {
    println!("{} {}: {}", Icons::INFO, label.style(theme().dim.clone()), value);
}

pub fn removed(path: &str) {
    println!("{} {}", Icons::DEL.style(theme().error.clone()), path);
}

#[derive(Tabled)]
struct StatsRow {
    #[tabled(rename = "Store")]
    store: String,
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Objects")]
    objects: usize,
}

/// One row per entity per store; stores without rows get a dash
pub fn stats_table(stats: &[StoreStats]) -> String {
    let mut rows = Vec::new();
    for store in stats {
        if store.entities.is_empty() {
            rows.push(StatsRow { store: store.configuration.clone(), entity: "-".to_string(), objects: 0 });
        }
        for (entity, count) in &store.entities {
            rows.push(StatsRow { store: store.configuration.clone(), entity: entity.clone(), objects: *count });
        }
    }

    if rows.is_empty() {
        return String::new();
    }
    Table::new(&rows).with(TableStyle::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_table_rows() {
        let stats = vec![
            StoreStats {
                configuration: "<default>".to_string(),
                location: None,
                entities: vec![("Note".to_string(), 3)],
            },
            StoreStats { configuration: "cache".to_string(), location: None, entities: Vec::new() },
        ];

        let table = stats_table(&stats);
        assert!(table.contains("Note"));
        assert!(table.contains("cache"));
        assert!(table.contains("Objects"));
        assert!(stats_table(&[]).is_empty());
    }
}
