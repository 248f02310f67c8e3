//! Email notifications for build successes and every failure path.
//!
//! Bodies are rendered from the embedded templates; the three brand images
//! ride along inline, referenced by Content-ID. Failure reports go to the
//! NOC list; customer-facing mails go to the resource's email list, falling
//! back to the NOC list when a resource carries none.

use std::fmt;
use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use tracing::{debug, error};

use iaas::resource::{Backup, Snapshot, Vm};
use settings::Settings;

const LOGO_PNG: &[u8] = include_bytes!("../assets/logo.png");
const TWITTER_PNG: &[u8] = include_bytes!("../assets/twitter.png");
const WEBSITE_PNG: &[u8] = include_bytes!("../assets/website.png");

const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum NotifyError {
    Address(lettre::address::AddressError),
    Compose(lettre::error::Error),
    Smtp(lettre::transport::smtp::Error),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Address(err) => write!(f, "bad email address: {err}"),
            NotifyError::Compose(err) => write!(f, "could not compose email: {err}"),
            NotifyError::Smtp(err) => write!(f, "smtp send failed: {err}"),
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<lettre::address::AddressError> for NotifyError {
    fn from(err: lettre::address::AddressError) -> Self {
        NotifyError::Address(err)
    }
}

impl From<lettre::error::Error> for NotifyError {
    fn from(err: lettre::error::Error) -> Self {
        NotifyError::Compose(err)
    }
}

impl From<lettre::transport::smtp::Error> for NotifyError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        NotifyError::Smtp(err)
    }
}

type Result<T> = std::result::Result<T, NotifyError>;

// ─── Template contexts ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct VmEmailCtx<'a> {
    id: i64,
    name: &'a str,
    compute_url: &'a str,
    admin_password: &'a str,
}

#[derive(Serialize)]
struct FailureCtx<'a> {
    id: i64,
    name: &'a str,
    vm_id: i64,
    vm_name: &'a str,
    task: &'a str,
    errors: &'a [String],
    data: String,
    compute_url: &'a str,
}

/// Context for the VPN success email; assembled by the virtual router
/// worker which owns the derived tunnel values.
#[derive(Debug, Clone, Serialize)]
pub struct VpnEmail {
    pub id: i64,
    pub project_id: i64,
    pub stif_number: i64,
    pub virtual_router_ip: String,
    pub podnet_cpe: String,
    pub build: bool,
    #[serde(skip)]
    pub emails: Vec<String>,
}

pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    settings: Settings,
}

impl EmailNotifier {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.email_host)?
            .port(settings.email_port)
            .credentials(Credentials::new(
                settings.email_user.clone(),
                settings.email_password.clone(),
            ))
            .timeout(Some(SMTP_TIMEOUT))
            .build();
        Ok(Self { mailer, settings: settings.clone() })
    }

    fn noc_recipients(&self) -> Vec<String> {
        self.settings
            .send_to_fail
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    /// The resource's own recipients, or the NOC list when it has none.
    fn recipients_or_noc(&self, emails: Option<&Vec<String>>) -> Vec<String> {
        match emails {
            Some(list) if !list.is_empty() => list.clone(),
            _ => self.noc_recipients(),
        }
    }

    fn data_blob<T: Serialize>(resource: &T) -> String {
        serde_json::to_string_pretty(resource).unwrap_or_else(|_| "<unserializable>".to_string())
    }

    // ─── VM ────────────────────────────────────────────────────────────

    pub async fn vm_build_success(&self, vm: &Vm, admin_password: &str) {
        debug!(vm_id = vm.id, "sending build success email");
        let ctx = VmEmailCtx {
            id: vm.id,
            name: vm.name.as_deref().unwrap_or_default(),
            compute_url: &self.settings.compute_ui_url,
            admin_password,
        };
        let subject = self.settings.subject_vm_success();
        self.send_rendered(
            "emails/vm_build_success.html",
            &ctx,
            &subject,
            &self.recipients_or_noc(vm.emails.as_ref()),
        )
        .await;
    }

    pub async fn vm_build_failure(&self, vm: &Vm, errors: &[String]) {
        let ctx = VmEmailCtx {
            id: vm.id,
            name: vm.name.as_deref().unwrap_or_default(),
            compute_url: &self.settings.compute_ui_url,
            admin_password: "",
        };
        let subject = self.settings.subject_vm_fail();
        self.send_rendered(
            "emails/vm_build_failure.html",
            &ctx,
            &subject,
            &self.recipients_or_noc(vm.emails.as_ref()),
        )
        .await;

        // The generic failure report also goes to the NOC
        self.vm_failure(vm, "build", errors).await;
    }

    pub async fn vm_failure(&self, vm: &Vm, task: &str, errors: &[String]) {
        debug!(vm_id = vm.id, task, "sending failure email");
        let ctx = FailureCtx {
            id: vm.id,
            name: vm.name.as_deref().unwrap_or_default(),
            vm_id: vm.id,
            vm_name: vm.name.as_deref().unwrap_or_default(),
            task,
            errors,
            data: Self::data_blob(vm),
            compute_url: &self.settings.compute_ui_url,
        };
        let subject = self.settings.subject_project_fail();
        self.send_rendered("emails/vm_failure.html", &ctx, &subject, &self.noc_recipients())
            .await;
    }

    /// `deletion_date` is the human-readable day the scrub sweep will
    /// remove the VM for good.
    pub async fn delete_schedule_success(&self, vm: &Vm, deletion_date: &str) {
        #[derive(Serialize)]
        struct Ctx<'a> {
            id: i64,
            name: &'a str,
            compute_url: &'a str,
            deletion_date: &'a str,
        }
        let ctx = Ctx {
            id: vm.id,
            name: vm.name.as_deref().unwrap_or_default(),
            compute_url: &self.settings.compute_ui_url,
            deletion_date,
        };
        let subject = self.settings.subject_vm_schedule_delete();
        self.send_rendered(
            "emails/scheduled_delete_success.html",
            &ctx,
            &subject,
            &self.recipients_or_noc(vm.emails.as_ref()),
        )
        .await;
    }

    // ─── Virtual router / VPN ──────────────────────────────────────────

    pub async fn virtual_router_failure<T: Serialize>(
        &self,
        vr_id: i64,
        resource: &T,
        task: &str,
        errors: &[String],
    ) {
        debug!(virtual_router_id = vr_id, task, "sending failure email");
        let ctx = FailureCtx {
            id: vr_id,
            name: "",
            vm_id: 0,
            vm_name: "",
            task,
            errors,
            data: Self::data_blob(resource),
            compute_url: &self.settings.compute_ui_url,
        };
        let subject = self.settings.subject_virtual_router_fail();
        self.send_rendered(
            "emails/virtual_router_failure.html",
            &ctx,
            &subject,
            &self.noc_recipients(),
        )
        .await;
    }

    pub async fn vpn_success(&self, vpn: &VpnEmail) {
        debug!(vpn_id = vpn.id, build = vpn.build, "sending vpn success email");
        let subject = if vpn.build {
            self.settings.subject_vpn_build_success()
        } else {
            self.settings.subject_vpn_update_success()
        };
        #[derive(Serialize)]
        struct Ctx<'a> {
            id: i64,
            project_id: i64,
            stif_number: i64,
            virtual_router_ip: &'a str,
            podnet_cpe: &'a str,
            build: bool,
            compute_url: &'a str,
        }
        let ctx = Ctx {
            id: vpn.id,
            project_id: vpn.project_id,
            stif_number: vpn.stif_number,
            virtual_router_ip: &vpn.virtual_router_ip,
            podnet_cpe: &vpn.podnet_cpe,
            build: vpn.build,
            compute_url: &self.settings.compute_ui_url,
        };
        let recipients = if vpn.emails.is_empty() {
            self.noc_recipients()
        } else {
            vpn.emails.clone()
        };
        self.send_rendered("emails/vpn_success.html", &ctx, &subject, &recipients).await;
    }

    // ─── Backup / Snapshot ─────────────────────────────────────────────

    pub async fn backup_failure(&self, backup: &Backup, task: &str, errors: &[String]) {
        let ctx = FailureCtx {
            id: backup.id,
            name: backup.name.as_deref().unwrap_or_default(),
            vm_id: backup.vm.id,
            vm_name: backup.vm.name.as_deref().unwrap_or_default(),
            task,
            errors,
            data: Self::data_blob(backup),
            compute_url: &self.settings.compute_ui_url,
        };
        let subject = self.settings.subject_backup_fail();
        self.send_rendered("emails/backup_failure.html", &ctx, &subject, &self.noc_recipients())
            .await;
    }

    pub async fn backup_build_failure(&self, backup: &Backup, errors: &[String]) {
        #[derive(Serialize)]
        struct Ctx<'a> {
            vm_name: &'a str,
        }
        let ctx = Ctx { vm_name: backup.vm.name.as_deref().unwrap_or_default() };
        let subject = self.settings.subject_backup_build_fail();
        self.send_rendered(
            "emails/backup_build_failure.html",
            &ctx,
            &subject,
            &self.recipients_or_noc(backup.vm.emails.as_ref()),
        )
        .await;

        self.backup_failure(backup, "build", errors).await;
    }

    pub async fn snapshot_failure(&self, snapshot: &Snapshot, task: &str, errors: &[String]) {
        let ctx = FailureCtx {
            id: snapshot.id,
            name: snapshot.name.as_deref().unwrap_or_default(),
            vm_id: snapshot.vm.id,
            vm_name: snapshot.vm.name.as_deref().unwrap_or_default(),
            task,
            errors,
            data: Self::data_blob(snapshot),
            compute_url: &self.settings.compute_ui_url,
        };
        let subject = self.settings.subject_snapshot_fail();
        self.send_rendered("emails/snapshot_failure.html", &ctx, &subject, &self.noc_recipients())
            .await;
    }

    pub async fn snapshot_build_failure(&self, snapshot: &Snapshot, errors: &[String]) {
        #[derive(Serialize)]
        struct Ctx<'a> {
            id: i64,
            vm_name: &'a str,
            compute_url: &'a str,
        }
        let ctx = Ctx {
            id: snapshot.id,
            vm_name: snapshot.vm.name.as_deref().unwrap_or_default(),
            compute_url: &self.settings.compute_ui_url,
        };
        let subject = self.settings.subject_snapshot_build_fail();
        self.send_rendered(
            "emails/snapshot_build_failure.html",
            &ctx,
            &subject,
            &self.recipients_or_noc(snapshot.vm.emails.as_ref()),
        )
        .await;

        self.snapshot_failure(snapshot, "build", errors).await;
    }

    // ─── Plumbing ──────────────────────────────────────────────────────

    /// Render `template` with `ctx` and send it to each recipient. Send
    /// errors are logged, never propagated.
    async fn send_rendered<C: Serialize>(
        &self,
        template: &str,
        ctx: &C,
        subject: &str,
        recipients: &[String],
    ) {
        let body = match templates::render(template, ctx) {
            Ok(body) => body,
            Err(err) => {
                error!(template, error = %err, "could not render email body");
                return;
            }
        };
        for recipient in recipients {
            if let Err(err) = self.send_one(recipient, subject, &body).await {
                error!(recipient, error = %err, "failed to send email");
            } else {
                debug!(recipient, subject, "email sent");
            }
        }
    }

    async fn send_one(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let png = ContentType::parse("image/png").expect("static content type");
        let message = Message::builder()
            .from(self.settings.email_user.parse()?)
            .reply_to(self.settings.email_reply_to.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .multipart(
                MultiPart::related()
                    .singlepart(SinglePart::html(body.to_string()))
                    .singlepart(
                        Attachment::new_inline("logo.png".to_string())
                            .body(LOGO_PNG.to_vec(), png.clone()),
                    )
                    .singlepart(
                        Attachment::new_inline("twitter.png".to_string())
                            .body(TWITTER_PNG.to_vec(), png.clone()),
                    )
                    .singlepart(
                        Attachment::new_inline("website.png".to_string())
                            .body(WEBSITE_PNG.to_vec(), png),
                    ),
            )?;
        self.mailer.send(message).await?;
        Ok(())
    }
}
