//! Types managed entirely from the Git config repository: watcher rules,
//! workflows, and the small set of settings blocks embedded in
//! [`crate::ManagedConfig`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileWatcherSettings {
    #[serde(default)]
    pub scan_dir: String,
    #[serde(default)]
    pub scan_sub_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    Absolute,
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Write,
}

/// `startHour:startMinute` to `endHour:endMinute`, plus a day-of-week
/// bitmask (`weekDayInterval`, bit 0 = Sunday). All-zero fields mean
/// "no restrictions" (§8 boundary case).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeRestrictions {
    #[serde(default)]
    pub start_hour: u8,
    #[serde(default)]
    pub start_minute: u8,
    #[serde(default)]
    pub end_hour: u8,
    #[serde(default)]
    pub end_minute: u8,
    #[serde(default)]
    pub week_day_interval: u8,
}

impl TimeRestrictions {
    /// True iff the given hour/minute/weekday (weekday bit already shifted
    /// to the 0..=6 range used by `week_day_interval`) falls inside this
    /// window. An all-zero restriction always admits.
    pub fn admits(&self, hour: u8, minute: u8, weekday_bit: u8) -> bool {
        let is_zero = self.start_hour == 0
            && self.start_minute == 0
            && self.end_hour == 0
            && self.end_minute == 0
            && self.week_day_interval == 0;
        if is_zero {
            return true;
        }
        if self.week_day_interval != 0 && (self.week_day_interval & (1 << weekday_bit)) == 0 {
            return false;
        }
        let now = (hour as u16) * 60 + minute as u16;
        let start = (self.start_hour as u16) * 60 + self.start_minute as u16;
        let end = (self.end_hour as u16) * 60 + self.end_minute as u16;
        if start <= end {
            now >= start && now <= end
        } else {
            // window wraps midnight
            now >= start || now <= end
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingOptions {
    #[serde(default)]
    pub check_file_in_use: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_delay_retry")]
    pub delay_retry: u64,
    #[serde(default)]
    pub delay_next_file: u64,
    #[serde(default)]
    pub scan_sub_dir: bool,
}

fn default_max_retries() -> u32 {
    10
}

fn default_delay_retry() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileWatcherRule {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub watch_mode: WatchMode,
    pub dir_reg_ex: String,
    #[serde(default)]
    pub file_reg_ex: String,
    #[serde(default)]
    pub content_reg_ex: Option<String>,
    #[serde(default)]
    pub operations: Vec<FileOperation>,
    #[serde(default)]
    pub time_restrictions: TimeRestrictions,
    #[serde(default)]
    pub processing_options: ProcessingOptions,

    // ─── File operation pipeline (§4.7) ───────────────────────────────
    #[serde(default)]
    pub exec_prog_before: Option<String>,
    #[serde(default)]
    pub copy_to_dir: Option<String>,
    #[serde(default)]
    pub rename_file_to: Option<String>,
    #[serde(default)]
    pub insert_timestamp: bool,
    #[serde(default)]
    pub backup_to_dir: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub copy_temp_extension: Option<String>,
    /// 21 = move, 22 = copy (PRD-native op codes, kept bit-exact with the
    /// original tool's config format).
    #[serde(default = "default_copy_file_option")]
    pub copy_file_option: u8,
    #[serde(default)]
    pub remove_after_copy: bool,
    #[serde(default)]
    pub exec_prog_error: Option<String>,
    #[serde(default)]
    pub exec_prog: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_copy_file_option() -> u8 {
    21
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerType {
    File {
        path: String,
        pattern: String,
    },
    Schedule {
        #[serde(default, rename = "intervalSecs")]
        interval_secs: Option<u64>,
        #[serde(default)]
        cron: Option<String>,
    },
    Webhook {
        #[serde(default)]
        path: Option<String>,
        #[serde(default = "default_webhook_method")]
        method: String,
    },
    Filewatcher,
    Manual,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(flatten)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub start_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default, rename = "onError")]
    pub on_error: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub trigger: Trigger,
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Start set per §4.8: `trigger.startSteps`, falling back to all steps
    /// in declaration order when absent (documented open question — this
    /// expansion treats the fallback as intentional, matching legacy
    /// workflows that predate the `startSteps` field).
    pub fn start_step_ids(&self) -> Vec<String> {
        if self.trigger.start_steps.is_empty() {
            self.steps.iter().map(|s| s.id.clone()).collect()
        } else {
            self.trigger.start_steps.clone()
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileBrowserSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default = "default_max_list_items")]
    pub max_list_items: u32,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
}

fn default_max_list_items() -> u32 {
    1000
}

fn default_max_upload_size() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_size_mb() -> u64 {
    50
}
fn default_max_age_days() -> u64 {
    14
}
fn default_max_backups() -> u32 {
    5
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_size_mb: default_max_size_mb(),
            max_age_days: default_max_age_days(),
            max_backups: default_max_backups(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_valued_time_restrictions_admit_all() {
        let tr = TimeRestrictions::default();
        assert!(tr.admits(0, 0, 0));
        assert!(tr.admits(23, 59, 6));
    }

    #[test]
    fn time_restrictions_respect_weekday_bitmask() {
        let tr = TimeRestrictions {
            start_hour: 0,
            start_minute: 0,
            end_hour: 23,
            end_minute: 59,
            week_day_interval: 0b0000010, // only Monday (bit 1)
        };
        assert!(tr.admits(10, 0, 1));
        assert!(!tr.admits(10, 0, 2));
    }

    #[test]
    fn workflow_start_steps_falls_back_to_all_steps() {
        let wf = Workflow {
            id: "wf1".into(),
            name: "test".into(),
            enabled: true,
            trigger: Trigger {
                trigger_type: TriggerType::Manual,
                start_steps: vec![],
            },
            steps: vec![
                Step {
                    id: "a".into(),
                    step_type: "run-command".into(),
                    config: HashMap::new(),
                    next: vec![],
                    on_error: vec![],
                },
                Step {
                    id: "b".into(),
                    step_type: "run-command".into(),
                    config: HashMap::new(),
                    next: vec![],
                    on_error: vec![],
                },
            ],
        };
        assert_eq!(wf.start_step_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn rule_serializes_with_camel_case_fields() {
        let rule = FileWatcherRule {
            id: "r1".into(),
            enabled: true,
            watch_mode: WatchMode::Pattern,
            dir_reg_ex: "inbox$".into(),
            file_reg_ex: r"\.csv$".into(),
            content_reg_ex: None,
            operations: vec![FileOperation::Create],
            time_restrictions: TimeRestrictions::default(),
            processing_options: ProcessingOptions::default(),
            exec_prog_before: None,
            copy_to_dir: Some("/data/processed".into()),
            rename_file_to: None,
            insert_timestamp: true,
            backup_to_dir: None,
            overwrite: false,
            copy_temp_extension: None,
            copy_file_option: 21,
            remove_after_copy: false,
            exec_prog_error: None,
            exec_prog: None,
        };
        let s = serde_json::to_string(&rule).unwrap();
        assert!(s.contains("dirRegEx"));
        assert!(s.contains("copyToDir"));
    }
}
