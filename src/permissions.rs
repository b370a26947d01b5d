//! Capability toggles gating what the automated assistant may do in a
//! conversation, kept separately for the dashboard and the landing page.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Surface;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    CoreLegalServices,
    ClientServices,
    BusinessOperations,
    PlatformSupport,
    AdvancedOperations,
    EmergencyEscalation,
}

impl CapabilityCategory {
    pub const ALL: [CapabilityCategory; 6] = [
        CapabilityCategory::CoreLegalServices,
        CapabilityCategory::ClientServices,
        CapabilityCategory::BusinessOperations,
        CapabilityCategory::PlatformSupport,
        CapabilityCategory::AdvancedOperations,
        CapabilityCategory::EmergencyEscalation,
    ];

    pub fn title(self) -> &'static str {
        match self {
            CapabilityCategory::CoreLegalServices => "Core legal services",
            CapabilityCategory::ClientServices => "Client services",
            CapabilityCategory::BusinessOperations => "Business operations",
            CapabilityCategory::PlatformSupport => "Platform support",
            CapabilityCategory::AdvancedOperations => "Advanced operations",
            CapabilityCategory::EmergencyEscalation => "Emergency & escalation",
        }
    }

    pub fn capabilities(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .into_iter()
            .filter(move |capability| capability.category() == self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    // core legal services
    CaseIntake,
    LegalInformation,
    DocumentReview,
    AppointmentScheduling,
    CaseStatusUpdates,
    ConflictCheck,
    LegalResearch,
    // client services
    ClientOnboarding,
    BillingSupport,
    DocumentRequests,
    FeedbackCollection,
    ClientPortalHelp,
    LanguageTranslation,
    // business operations
    ProcessPayments,
    GenerateInvoices,
    LeadQualification,
    MarketingFollowUp,
    ReferralManagement,
    ReportGeneration,
    // platform support
    TechnicalSupport,
    AccountManagement,
    PasswordReset,
    FeatureGuidance,
    IntegrationHelp,
    SubscriptionChanges,
    // advanced operations
    DocumentDrafting,
    ContractAnalysis,
    CourtDeadlineTracking,
    EvidenceOrganization,
    DataExport,
    // emergency and escalation
    EmergencyEscalation,
    HumanHandoff,
    CrisisResources,
    ComplaintHandling,
    AfterHoursUrgent,
}

impl Capability {
    pub const ALL: [Capability; 35] = [
        Capability::CaseIntake,
        Capability::LegalInformation,
        Capability::DocumentReview,
        Capability::AppointmentScheduling,
        Capability::CaseStatusUpdates,
        Capability::ConflictCheck,
        Capability::LegalResearch,
        Capability::ClientOnboarding,
        Capability::BillingSupport,
        Capability::DocumentRequests,
        Capability::FeedbackCollection,
        Capability::ClientPortalHelp,
        Capability::LanguageTranslation,
        Capability::ProcessPayments,
        Capability::GenerateInvoices,
        Capability::LeadQualification,
        Capability::MarketingFollowUp,
        Capability::ReferralManagement,
        Capability::ReportGeneration,
        Capability::TechnicalSupport,
        Capability::AccountManagement,
        Capability::PasswordReset,
        Capability::FeatureGuidance,
        Capability::IntegrationHelp,
        Capability::SubscriptionChanges,
        Capability::DocumentDrafting,
        Capability::ContractAnalysis,
        Capability::CourtDeadlineTracking,
        Capability::EvidenceOrganization,
        Capability::DataExport,
        Capability::EmergencyEscalation,
        Capability::HumanHandoff,
        Capability::CrisisResources,
        Capability::ComplaintHandling,
        Capability::AfterHoursUrgent,
    ];

    pub fn category(self) -> CapabilityCategory {
        use Capability::*;
        match self {
            CaseIntake | LegalInformation | DocumentReview | AppointmentScheduling
            | CaseStatusUpdates | ConflictCheck | LegalResearch => {
                CapabilityCategory::CoreLegalServices
            }
            ClientOnboarding | BillingSupport | DocumentRequests | FeedbackCollection
            | ClientPortalHelp | LanguageTranslation => CapabilityCategory::ClientServices,
            ProcessPayments | GenerateInvoices | LeadQualification | MarketingFollowUp
            | ReferralManagement | ReportGeneration => CapabilityCategory::BusinessOperations,
            TechnicalSupport | AccountManagement | PasswordReset | FeatureGuidance
            | IntegrationHelp | SubscriptionChanges => CapabilityCategory::PlatformSupport,
            DocumentDrafting | ContractAnalysis | CourtDeadlineTracking | EvidenceOrganization
            | DataExport => CapabilityCategory::AdvancedOperations,
            EmergencyEscalation | HumanHandoff | CrisisResources | ComplaintHandling
            | AfterHoursUrgent => CapabilityCategory::EmergencyEscalation,
        }
    }

    /// Wire name, as used for the JSON key.
    pub fn key(self) -> String {
        match serde_json::to_value(self) {
            Ok(Value::String(key)) => key,
            _ => format!("{self:?}"),
        }
    }
}

/// Flat capability → enabled map. Keys that are absent read as disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeMap<Capability, bool>);

impl PermissionSet {
    pub fn from_enabled(enabled: &[Capability]) -> Self {
        Self(
            Capability::ALL
                .into_iter()
                .map(|capability| (capability, enabled.contains(&capability)))
                .collect(),
        )
    }

    pub fn dashboard_defaults() -> Self {
        Self::from_enabled(&[
            Capability::CaseIntake,
            Capability::LegalInformation,
            Capability::DocumentReview,
            Capability::AppointmentScheduling,
            Capability::CaseStatusUpdates,
            Capability::ClientOnboarding,
            Capability::BillingSupport,
            Capability::DocumentRequests,
            Capability::ClientPortalHelp,
            Capability::TechnicalSupport,
            Capability::AccountManagement,
            Capability::PasswordReset,
            Capability::FeatureGuidance,
            Capability::EmergencyEscalation,
            Capability::HumanHandoff,
            Capability::CrisisResources,
        ])
    }

    pub fn landing_defaults() -> Self {
        Self::from_enabled(&[
            Capability::CaseIntake,
            Capability::LegalInformation,
            Capability::AppointmentScheduling,
            Capability::LeadQualification,
            Capability::FeedbackCollection,
            Capability::EmergencyEscalation,
            Capability::HumanHandoff,
            Capability::CrisisResources,
        ])
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        self.0.get(&capability).copied().unwrap_or(false)
    }

    /// Sets one capability. Returns whether the stored value changed.
    pub fn set(&mut self, capability: Capability, enabled: bool) -> bool {
        let previous = self.0.insert(capability, enabled);
        previous != Some(enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionMatrix {
    pub dashboard: PermissionSet,
    pub landing: PermissionSet,
}

impl Default for PermissionMatrix {
    fn default() -> Self {
        Self {
            dashboard: PermissionSet::dashboard_defaults(),
            landing: PermissionSet::landing_defaults(),
        }
    }
}

impl PermissionMatrix {
    pub fn surface(&self, surface: Surface) -> &PermissionSet {
        match surface {
            Surface::Dashboard => &self.dashboard,
            Surface::Landing => &self.landing,
        }
    }

    pub fn surface_mut(&mut self, surface: Surface) -> &mut PermissionSet {
        match surface {
            Surface::Dashboard => &mut self.dashboard,
            Surface::Landing => &mut self.landing,
        }
    }

    pub fn is_enabled(&self, surface: Surface, capability: Capability) -> bool {
        self.surface(surface).is_enabled(capability)
    }

    pub fn set(&mut self, surface: Surface, capability: Capability, enabled: bool) -> bool {
        self.surface_mut(surface).set(capability, enabled)
    }
}

/// Config document field holding the permission set for a surface.
pub fn surface_field(surface: Surface) -> &'static str {
    match surface {
        Surface::Dashboard => "dashboardPermissions",
        Surface::Landing => "landingPermissions",
    }
}

/// Partial config document that updates exactly one capability.
pub fn toggle_patch(surface: Surface, capability: Capability, enabled: bool) -> Value {
    let mut inner = serde_json::Map::new();
    inner.insert(capability.key(), Value::Bool(enabled));
    let mut outer = serde_json::Map::new();
    outer.insert(surface_field(surface).to_string(), Value::Object(inner));
    Value::Object(outer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn there_are_thirty_five_capabilities_in_six_categories() {
        assert_eq!(Capability::ALL.len(), 35);
        let unique: HashSet<_> = Capability::ALL.into_iter().collect();
        assert_eq!(unique.len(), 35);
        let categories: HashSet<_> = Capability::ALL
            .into_iter()
            .map(Capability::category)
            .collect();
        assert_eq!(categories.len(), 6);
        let total: usize = CapabilityCategory::ALL
            .into_iter()
            .map(|category| category.capabilities().count())
            .sum();
        assert_eq!(total, 35);
    }

    #[test]
    fn flipping_one_capability_leaves_every_other_key_untouched() {
        for target in Capability::ALL {
            let mut matrix = PermissionMatrix::default();
            let before = matrix.clone();
            let flipped = !matrix.is_enabled(Surface::Dashboard, target);
            matrix.set(Surface::Dashboard, target, flipped);

            for other in Capability::ALL {
                if other != target {
                    assert_eq!(
                        matrix.is_enabled(Surface::Dashboard, other),
                        before.is_enabled(Surface::Dashboard, other),
                        "{other:?} changed when {target:?} was flipped"
                    );
                }
                assert_eq!(
                    matrix.is_enabled(Surface::Landing, other),
                    before.is_enabled(Surface::Landing, other),
                    "landing {other:?} changed by a dashboard flip"
                );
            }
        }
    }

    #[test]
    fn setting_the_same_value_twice_is_a_no_op() {
        let mut set = PermissionSet::default();
        assert!(set.set(Capability::ProcessPayments, true));
        let once = set.clone();
        assert!(!set.set(Capability::ProcessPayments, true));
        assert_eq!(set, once);
    }

    #[test]
    fn no_coupling_between_capabilities() {
        let mut set = PermissionSet::from_enabled(&[]);
        set.set(Capability::ProcessPayments, true);
        assert!(set.is_enabled(Capability::ProcessPayments));
        assert!(!set.is_enabled(Capability::BillingSupport));
    }

    #[test]
    fn wire_keys_are_camel_case() {
        assert_eq!(Capability::ProcessPayments.key(), "processPayments");
        assert_eq!(Capability::AfterHoursUrgent.key(), "afterHoursUrgent");
        assert_eq!(
            toggle_patch(Surface::Landing, Capability::BillingSupport, false),
            json!({ "landingPermissions": { "billingSupport": false } })
        );
    }

    #[test]
    fn permission_set_round_trips_through_a_json_object() {
        let set = PermissionSet::from_enabled(&[Capability::DataExport]);
        let value = serde_json::to_value(&set).expect("serialize");
        assert_eq!(value["dataExport"], Value::Bool(true));
        assert_eq!(value["caseIntake"], Value::Bool(false));
        let back: PermissionSet = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, set);
    }
}
