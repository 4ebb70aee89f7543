use super::money::Amount;
use super::receiver::ChannelCode;
use crate::error::{DivisionError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DivisionStatus {
    #[default]
    None,
    Processing,
    Finished,
}

/// A captured payment as seen by the division engine.
///
/// Capture owns everything here except `division_status`, which only the
/// division ledger writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub merchant_id: String,
    pub app_id: String,
    pub channel: ChannelCode,
    /// The channel's own transaction id for the captured payment.
    pub channel_order_ref: String,
    pub amount: Amount,
    pub division_eligible: bool,
    #[serde(default)]
    pub division_status: DivisionStatus,
}

impl Order {
    /// Checks that capture is complete and the order has not been divided yet.
    pub fn ensure_divisible(&self) -> Result<()> {
        if !self.division_eligible {
            return Err(self.not_eligible("capture incomplete or division not enabled"));
        }
        if self.division_status == DivisionStatus::Finished {
            return Err(self.not_eligible("division already finished"));
        }
        if self.amount.is_zero() {
            return Err(self.not_eligible("order amount is zero"));
        }
        Ok(())
    }

    pub(crate) fn not_eligible(&self, reason: &str) -> DivisionError {
        DivisionError::OrderNotEligible {
            order_id: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn order(id: &str, channel: &str, amount: u64) -> Order {
        Order {
            id: id.to_string(),
            merchant_id: "M1".to_string(),
            app_id: "APP1".to_string(),
            channel: ChannelCode::new(channel),
            channel_order_ref: format!("CH-{id}"),
            amount: Amount::new(amount),
            division_eligible: true,
            division_status: DivisionStatus::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::order;
    use super::*;

    #[test]
    fn test_ensure_divisible() {
        let mut o = order("P1", ChannelCode::WXPAY, 100);
        assert!(o.ensure_divisible().is_ok());

        o.division_status = DivisionStatus::Processing;
        assert!(o.ensure_divisible().is_ok());

        o.division_status = DivisionStatus::Finished;
        assert!(matches!(
            o.ensure_divisible(),
            Err(DivisionError::OrderNotEligible { .. })
        ));

        let mut o = order("P2", ChannelCode::WXPAY, 100);
        o.division_eligible = false;
        assert!(matches!(
            o.ensure_divisible(),
            Err(DivisionError::OrderNotEligible { .. })
        ));
    }

    #[test]
    fn test_order_csv_deserialization() {
        let csv = "id,merchant_id,app_id,channel,channel_order_ref,amount,division_eligible\n\
                   P1,M1,APP1,wxpay,420000001,10000,true";
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let o: Order = reader.deserialize().next().unwrap().unwrap();

        assert_eq!(o.amount, Amount::new(10_000));
        assert_eq!(o.division_status, DivisionStatus::None);
        assert_eq!(o.channel.as_str(), "wxpay");
    }
}
