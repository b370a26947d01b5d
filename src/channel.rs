//! Editing rules for a channel configuration: provider switching, list-valued
//! fields, clamped numeric knobs, and the working-hours schedule.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::permissions::surface_field;
use crate::types::{
    AiSettings, ChannelConfig, ChannelKind, DaySchedule, LiveChatConfig, ProviderKind,
    ProviderSettings, Surface, VoiceSettings, VoipConfig, WorkingHours,
};

/// A persisted per-channel configuration document.
pub trait ConfigDocument:
    Serialize + DeserializeOwned + Default + Clone + PartialEq + Send + Sync + 'static
{
    const KIND: ChannelKind;

    /// Brings provider credentials in line with the selected provider.
    fn normalize(&mut self);

    fn is_enabled(&self) -> bool;

    /// Body sent by a full-document save. Fields owned by another editor are
    /// left out so the save cannot overwrite them.
    fn save_body(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl ConfigDocument for LiveChatConfig {
    const KIND: ChannelKind = ChannelKind::Livechat;

    fn normalize(&mut self) {
        self.channel.provider.normalize();
    }

    fn is_enabled(&self) -> bool {
        self.channel.enabled
    }

    /// Permissions are saved toggle by toggle, never with the document.
    fn save_body(&self) -> Result<Value, serde_json::Error> {
        let mut body = serde_json::to_value(self)?;
        if let Some(fields) = body.as_object_mut() {
            for surface in [Surface::Dashboard, Surface::Landing] {
                fields.remove(surface_field(surface));
            }
        }
        Ok(body)
    }
}

impl ConfigDocument for VoipConfig {
    const KIND: ChannelKind = ChannelKind::Voip;

    fn normalize(&mut self) {
        self.channel.provider.normalize();
    }

    fn is_enabled(&self) -> bool {
        self.channel.enabled
    }
}

/// `+` followed by 7 to 15 digits, no leading zero.
pub fn is_e164(number: &str) -> bool {
    Regex::new(r"^\+[1-9]\d{6,14}$")
        .map(|re| re.is_match(number.trim()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListField {
    TriggerKeywords,
    ForwardEmails,
    ForwardNumbers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSlot {
    Welcome,
    AfterHours,
}

/// Prepares a stored config document for merging `patch` into it. When the
/// patch switches the provider type, the stored credentials are dropped so
/// nothing from the previous provider carries over; only credentials sent
/// with the patch survive the merge.
pub fn reset_credentials_on_switch(stored: &mut Value, patch: &Value) {
    let Some(next_type) = patch.pointer("/provider/type") else {
        return;
    };
    if stored.pointer("/provider/type") == Some(next_type) {
        return;
    }
    if let Some(provider) = stored.get_mut("provider").and_then(Value::as_object_mut) {
        provider.remove("credentials");
    }
}

impl<P: ProviderKind> ProviderSettings<P> {
    /// Required credential fields that are missing or blank.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        self.kind
            .credential_fields()
            .iter()
            .copied()
            .filter(|field| {
                self.credentials
                    .get(*field)
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Drops credential keys the provider does not use and adds the ones it
    /// needs as empty strings.
    pub fn normalize(&mut self) {
        let fields = self.kind.credential_fields();
        self.credentials
            .retain(|key, _| fields.contains(&key.as_str()));
        for field in fields {
            self.credentials.entry(field.to_string()).or_default();
        }
    }
}

impl<P: ProviderKind> ChannelConfig<P> {
    /// Switches the provider and resets every credential field to empty.
    pub fn switch_provider(&mut self, kind: P) {
        self.provider = ProviderSettings::empty(kind);
    }

    pub fn set_credential(&mut self, field: &str, value: &str) -> bool {
        if !self.provider.kind.credential_fields().contains(&field) {
            return false;
        }
        self.provider
            .credentials
            .insert(field.to_string(), value.to_string());
        true
    }

    pub fn list(&self, field: ListField) -> &[String] {
        match field {
            ListField::TriggerKeywords => &self.human_handoff.trigger_keywords,
            ListField::ForwardEmails => &self.human_handoff.forward_emails,
            ListField::ForwardNumbers => &self.human_handoff.forward_numbers,
        }
    }

    fn list_mut(&mut self, field: ListField) -> &mut Vec<String> {
        match field {
            ListField::TriggerKeywords => &mut self.human_handoff.trigger_keywords,
            ListField::ForwardEmails => &mut self.human_handoff.forward_emails,
            ListField::ForwardNumbers => &mut self.human_handoff.forward_numbers,
        }
    }

    /// Appends a trimmed value unless it is blank. Duplicates are kept.
    pub fn add_list_value(&mut self, field: ListField, value: &str) -> bool {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return false;
        }
        self.list_mut(field).push(trimmed.to_string());
        true
    }

    /// Removes every entry equal to `value`; returns how many were removed.
    pub fn remove_list_value(&mut self, field: ListField, value: &str) -> usize {
        let list = self.list_mut(field);
        let before = list.len();
        list.retain(|entry| entry != value);
        before - list.len()
    }

    pub fn response_slot(&self, at: DateTime<Utc>) -> ResponseSlot {
        if self.working_hours.is_open(at) {
            ResponseSlot::Welcome
        } else {
            ResponseSlot::AfterHours
        }
    }

    pub fn greeting_template(&self, at: DateTime<Utc>) -> &str {
        match self.response_slot(at) {
            ResponseSlot::Welcome => &self.auto_responses.welcome,
            ResponseSlot::AfterHours => &self.auto_responses.after_hours,
        }
    }
}

impl AiSettings {
    pub fn set_confidence_threshold(&mut self, value: f64) {
        self.confidence_threshold = clamp(value, 0.0, 1.0);
    }

    pub fn set_temperature(&mut self, value: f64) {
        self.temperature = clamp(value, 0.0, 1.0);
    }
}

impl VoiceSettings {
    pub const SPEED_RANGE: (f64, f64) = (0.5, 2.0);
    pub const PITCH_RANGE: (f64, f64) = (0.5, 2.0);
    pub const VOLUME_RANGE: (f64, f64) = (0.0, 1.0);

    pub fn set_speed(&mut self, value: f64) {
        self.speed = clamp(value, Self::SPEED_RANGE.0, Self::SPEED_RANGE.1);
    }

    pub fn set_pitch(&mut self, value: f64) {
        self.pitch = clamp(value, Self::PITCH_RANGE.0, Self::PITCH_RANGE.1);
    }

    pub fn set_volume(&mut self, value: f64) {
        self.volume = clamp(value, Self::VOLUME_RANGE.0, Self::VOLUME_RANGE.1);
    }
}

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}

fn parse_clock(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

impl DaySchedule {
    fn window(&self) -> Option<(NaiveTime, NaiveTime)> {
        if !self.active {
            return None;
        }
        Some((parse_clock(&self.start)?, parse_clock(&self.end)?))
    }
}

impl WorkingHours {
    pub fn tz(&self) -> Tz {
        Tz::from_str(self.timezone.trim()).unwrap_or_else(|_| {
            tracing::warn!(timezone = %self.timezone, "unknown timezone, using UTC");
            Tz::UTC
        })
    }

    /// Whether `at` falls inside an active window. A window whose end is not
    /// after its start runs overnight into the following day.
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.tz());
        let today = crate::types::Day::from(local.weekday());
        let now = local.time();

        if let Some((start, end)) = self.days.get(&today).and_then(DaySchedule::window) {
            let open = if start < end {
                now >= start && now < end
            } else {
                now >= start
            };
            if open {
                return true;
            }
        }

        // tail of yesterday's overnight window
        if let Some((start, end)) = self
            .days
            .get(&today.previous())
            .and_then(DaySchedule::window)
        {
            if end <= start && now < end {
                return true;
            }
        }
        false
    }
}
