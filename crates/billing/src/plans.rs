//! Plan catalog
//!
//! Maps Stripe price ids to the plans shown to users. Prices themselves live
//! in Stripe; the amounts here are display values only.

use serde::{Deserialize, Serialize};

use crate::client::PriceIds;

/// Billing interval of a price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn adjective(&self) -> &'static str {
        match self {
            BillingInterval::Month => "monthly",
            BillingInterval::Year => "yearly",
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A paid plan with one monthly and one yearly price
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub title: String,
    pub description: String,
    pub benefits: Vec<String>,
    pub monthly_price: String,
    pub yearly_price: String,
    pub monthly_price_id: String,
    pub yearly_price_id: String,
}

impl Plan {
    pub fn price_id(&self, interval: BillingInterval) -> &str {
        match interval {
            BillingInterval::Month => &self.monthly_price_id,
            BillingInterval::Year => &self.yearly_price_id,
        }
    }
}

/// Title, description and benefits of the plan users get without paying
pub struct FreePlan;

impl FreePlan {
    pub const TITLE: &'static str = "Free";
    pub const DESCRIPTION: &'static str = "Get started with the essentials";

    pub fn benefits() -> Vec<String> {
        vec![
            "Core features".to_string(),
            "Community support".to_string(),
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    /// The single Pro plan, priced with the configured Stripe price ids
    pub fn with_prices(prices: &PriceIds) -> Self {
        Self::new(vec![Plan {
            title: "Pro".to_string(),
            description: "Unlock Advanced Features".to_string(),
            benefits: vec![
                "Everything in Free".to_string(),
                "Unlimited projects".to_string(),
                "File uploads".to_string(),
                "Priority support".to_string(),
            ],
            monthly_price: "9.99".to_string(),
            yearly_price: "99.99".to_string(),
            monthly_price_id: prices.pro_monthly.clone(),
            yearly_price_id: prices.pro_yearly.clone(),
        }])
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn resolve(&self, price_id: &str) -> Option<(&Plan, BillingInterval)> {
        if price_id.is_empty() {
            return None;
        }
        self.plans.iter().find_map(|plan| {
            if plan.monthly_price_id == price_id {
                Some((plan, BillingInterval::Month))
            } else if plan.yearly_price_id == price_id {
                Some((plan, BillingInterval::Year))
            } else {
                None
            }
        })
    }

    pub fn is_known(&self, price_id: &str) -> bool {
        self.resolve(price_id).is_some()
    }

    /// Every configured price id
    pub fn price_ids(&self) -> Vec<String> {
        self.plans
            .iter()
            .flat_map(|p| [p.monthly_price_id.clone(), p.yearly_price_id.clone()])
            .filter(|id| !id.is_empty())
            .collect()
    }

    /// Human label for a price, e.g. `Pro (monthly)`
    ///
    /// Unknown prices are labelled with their raw id so history stays useful.
    pub fn label(&self, price_id: &str) -> String {
        match self.resolve(price_id) {
            Some((plan, interval)) => format!("{} ({})", plan.title, interval.adjective()),
            None => price_id.to_string(),
        }
    }

    /// Plan title for a price, falling back to the generic subscription name
    pub fn title(&self, price_id: Option<&str>) -> String {
        price_id
            .and_then(|id| self.resolve(id))
            .map(|(plan, _)| plan.title.clone())
            .unwrap_or_else(|| "Premium".to_string())
    }
}
