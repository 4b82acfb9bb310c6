//! Backend environment for restic
//!
//! Translates a [`Backend`] plus its secret into the environment restic
//! reads (`RESTIC_REPOSITORY`, `RESTIC_PASSWORD`, provider credentials) and
//! writes the files some providers need under the scratch directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::Secret;
use reqwest::Url;
use tracing::debug;

use crate::crd::{Backend, BackendProvider};
use crate::{Error, Result};

/// Repository location
pub const RESTIC_REPOSITORY: &str = "RESTIC_REPOSITORY";
/// Repository password, required in every secret
pub const RESTIC_PASSWORD: &str = "RESTIC_PASSWORD";
/// Temp dir for restic
pub const TMPDIR: &str = "TMPDIR";
/// PEM bundle trusted for TLS to the backend
pub const CA_CERT_DATA: &str = "CA_CERT_DATA";

const GOOGLE_SERVICE_ACCOUNT_JSON_KEY: &str = "GOOGLE_SERVICE_ACCOUNT_JSON_KEY";
const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const REST_SERVER_USERNAME: &str = "REST_SERVER_USERNAME";
const REST_SERVER_PASSWORD: &str = "REST_SERVER_PASSWORD";

const S3_KEYS: &[&str] = &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"];
const GCS_KEYS: &[&str] = &["GOOGLE_PROJECT_ID"];
const AZURE_KEYS: &[&str] = &["AZURE_ACCOUNT_NAME", "AZURE_ACCOUNT_KEY"];
const B2_KEYS: &[&str] = &["B2_ACCOUNT_ID", "B2_ACCOUNT_KEY"];
const SWIFT_KEYS: &[&str] = &[
    // keystone v1
    "ST_AUTH",
    "ST_USER",
    "ST_KEY",
    // keystone v2
    "OS_AUTH_URL",
    "OS_REGION_NAME",
    "OS_USERNAME",
    "OS_PASSWORD",
    "OS_TENANT_ID",
    "OS_TENANT_NAME",
    // keystone v3
    "OS_USER_DOMAIN_NAME",
    "OS_PROJECT_NAME",
    "OS_PROJECT_DOMAIN_NAME",
    // token
    "OS_STORAGE_URL",
    "OS_AUTH_TOKEN",
];

/// Environment and side files for one repository
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendEnv {
    /// Variables passed to every restic invocation
    pub vars: BTreeMap<String, String>,
    /// Provider name, see [`BackendProvider::name`]
    pub provider: &'static str,
    /// Whether `-o <provider>.connections` applies
    pub connection_limit_supported: bool,
    /// CA bundle written from the secret
    pub ca_cert_file: Option<PathBuf>,
}

impl BackendEnv {
    /// The `RESTIC_REPOSITORY` value
    pub fn repository(&self) -> Option<&str> {
        self.vars.get(RESTIC_REPOSITORY).map(String::as_str)
    }
}

fn secret_bytes(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|s| s.clone().into_bytes())
        })
}

fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    secret_bytes(secret, key).map(|b| String::from_utf8_lossy(&b).into_owned())
}

/// Join path segments with `/`, dropping empty ones
fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn copy_keys(secret: &Secret, keys: &[&str], vars: &mut BTreeMap<String, String>) {
    for key in keys {
        if let Some(value) = secret_string(secret, key) {
            vars.insert(key.to_string(), value);
        }
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Build the restic environment for `backend`.
///
/// `prefix` is appended to the backend path so that hosts sharing a
/// backend get separate repositories. Fails when the secret lacks
/// `RESTIC_PASSWORD` or the backend is malformed.
pub fn setup_env(
    backend: &Backend,
    secret: &Secret,
    scratch_dir: &Path,
    prefix: &str,
) -> Result<BackendEnv> {
    let provider = backend.provider()?;
    let mut vars = BTreeMap::new();

    let password = secret_string(secret, RESTIC_PASSWORD).ok_or_else(|| {
        Error::validation(format!(
            "secret {} has no {RESTIC_PASSWORD}",
            backend.storage_secret_name
        ))
    })?;
    vars.insert(RESTIC_PASSWORD.to_string(), password);

    let tmp_dir = scratch_dir.join("restic-tmp");
    fs::create_dir_all(&tmp_dir)?;
    vars.insert(TMPDIR.to_string(), tmp_dir.display().to_string());

    let ca_cert_file = match secret_bytes(secret, CA_CERT_DATA) {
        Some(pem) => {
            let dir = scratch_dir.join("cacerts");
            fs::create_dir_all(&dir)?;
            let file = dir.join("ca.crt");
            fs::write(&file, pem)?;
            Some(file)
        }
        None => None,
    };

    let repository = match provider {
        BackendProvider::Local(local) => {
            let mut dir = PathBuf::from(&local.mount_path);
            let sub = join_path(&[prefix]);
            if !sub.is_empty() {
                dir.push(sub);
            }
            fs::create_dir_all(&dir)?;
            dir.display().to_string()
        }
        BackendProvider::S3(s3) => {
            copy_keys(secret, S3_KEYS, &mut vars);
            format!(
                "s3:{}/{}",
                s3.endpoint.trim_end_matches('/'),
                join_path(&[&s3.bucket, &s3.prefix, prefix])
            )
        }
        BackendProvider::Gcs(gcs) => {
            copy_keys(secret, GCS_KEYS, &mut vars);
            if let Some(key) = secret_bytes(secret, GOOGLE_SERVICE_ACCOUNT_JSON_KEY) {
                let path = scratch_dir.join("gcs_sa.json");
                write_private(&path, &key)?;
                vars.insert(
                    GOOGLE_APPLICATION_CREDENTIALS.to_string(),
                    path.display().to_string(),
                );
            }
            format!("gs:{}:/{}", gcs.bucket, join_path(&[&gcs.prefix, prefix]))
        }
        BackendProvider::Azure(azure) => {
            copy_keys(secret, AZURE_KEYS, &mut vars);
            format!(
                "azure:{}:/{}",
                azure.container,
                join_path(&[&azure.prefix, prefix])
            )
        }
        BackendProvider::Swift(swift) => {
            copy_keys(secret, SWIFT_KEYS, &mut vars);
            format!(
                "swift:{}:/{}",
                swift.container,
                join_path(&[&swift.prefix, prefix])
            )
        }
        BackendProvider::B2(b2) => {
            copy_keys(secret, B2_KEYS, &mut vars);
            format!("b2:{}:/{}", b2.bucket, join_path(&[&b2.prefix, prefix]))
        }
        BackendProvider::Rest(rest) => {
            let mut url = Url::parse(&rest.url)
                .map_err(|e| Error::validation(format!("invalid rest url {:?}: {e}", rest.url)))?;
            if let Some(user) = secret_string(secret, REST_SERVER_USERNAME) {
                url.set_username(&user)
                    .map_err(|_| Error::validation("rest url cannot carry credentials"))?;
                if let Some(password) = secret_string(secret, REST_SERVER_PASSWORD) {
                    url.set_password(Some(&password))
                        .map_err(|_| Error::validation("rest url cannot carry credentials"))?;
                }
            }
            format!("rest:{url}")
        }
    };

    debug!(provider = provider.name(), %repository, "Prepared backend environment");
    vars.insert(RESTIC_REPOSITORY.to_string(), repository);

    Ok(BackendEnv {
        vars,
        provider: provider.name(),
        connection_limit_supported: provider.supports_connection_limit(),
        ca_cert_file,
    })
}
