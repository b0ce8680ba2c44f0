use tracing::{debug, warn};

use crate::mail::{DynMailClient, EmailMessage};
use crate::models::{Deal, Payment, User, Voucher};

/// Best-effort purchase emails, sent after the purchase has committed.
/// Delivery failures are logged and dropped.
#[derive(Clone)]
pub struct Notifier {
    mail: DynMailClient,
    frontend_url: String,
}

impl Notifier {
    pub fn new(mail: DynMailClient, frontend_url: impl Into<String>) -> Self {
        Self {
            mail,
            frontend_url: frontend_url.into(),
        }
    }

    pub async fn purchase_completed(
        &self,
        user: &User,
        deal: &Deal,
        payment: &Payment,
        vouchers: &[Voucher],
    ) {
        self.deliver(self.confirmation(user, deal, payment, vouchers))
            .await;
        for voucher in vouchers {
            self.deliver(self.voucher_email(user, deal, payment, voucher))
                .await;
        }
    }

    async fn deliver(&self, message: EmailMessage) {
        let to = message.to.clone();
        let subject = message.subject.clone();
        match self.mail.send(message).await {
            Ok(()) => debug!(%to, %subject, "Email sent"),
            Err(e) => warn!(%to, %subject, error = %e, "Failed to send email"),
        }
    }

    fn confirmation(
        &self,
        user: &User,
        deal: &Deal,
        payment: &Payment,
        vouchers: &[Voucher],
    ) -> EmailMessage {
        let lines: Vec<String> = vouchers
            .iter()
            .map(|v| format!("- {}: {}", deal.title, v.voucher_code))
            .collect();

        EmailMessage {
            to: user.email.clone(),
            subject: format!("Your order for {} is confirmed", deal.title),
            body_html: None,
            body_text: Some(format!(
                "Hi {},\n\nThanks for your purchase.\n\nPayment reference: {}\nTotal: {} {:.2}\n\nVouchers:\n{}\n\nView them at {}/vouchers\n",
                user.first_name,
                payment.id,
                payment.currency,
                payment.amount.round_dp(2),
                lines.join("\n"),
                self.frontend_url,
            )),
        }
    }

    fn voucher_email(
        &self,
        user: &User,
        deal: &Deal,
        payment: &Payment,
        voucher: &Voucher,
    ) -> EmailMessage {
        EmailMessage {
            to: user.email.clone(),
            subject: format!("Your voucher for {}", deal.title),
            body_html: None,
            body_text: Some(format!(
                "Voucher code: {}\nDeal: {}\nPrice: {} {:.2}\nValid until: {}\n\nShow this code or its QR code at the venue: {}/vouchers/{}\n",
                voucher.voucher_code,
                deal.title,
                payment.currency,
                voucher.purchase_price.round_dp(2),
                voucher.expires_at.format("%Y-%m-%d"),
                self.frontend_url,
                voucher.id,
            )),
        }
    }
}
