use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use server_api::FileDirectory;
use shared::{domain::FileId, protocol::FileDescriptor};
use url::Url;

/// Looks attachments up in the external file service at
/// `GET {base}/files/{id}`.
pub(crate) struct HttpFileDirectory {
    http: reqwest::Client,
    base: Url,
}

impl HttpFileDirectory {
    pub(crate) fn new(base_url: &str) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url)
            .with_context(|| format!("invalid file service url '{base_url}'"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }
}

#[async_trait]
impl FileDirectory for HttpFileDirectory {
    async fn describe(&self, file_id: FileId) -> anyhow::Result<Option<FileDescriptor>> {
        let url = self.base.join(&format!("files/{}", file_id.0))?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("file service request to {url} failed"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let file = response
            .error_for_status()?
            .json::<FileDescriptor>()
            .await
            .context("file service returned an unreadable descriptor")?;
        Ok(Some(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::StatusCode as HttpStatus, routing::get, Json, Router};

    async fn spawn_file_service() -> String {
        async fn describe(Path(id): Path<i64>) -> Result<Json<FileDescriptor>, HttpStatus> {
            if id != 7 {
                return Err(HttpStatus::NOT_FOUND);
            }
            Ok(Json(FileDescriptor {
                file_id: FileId(7),
                file_name: "roadmap.pdf".into(),
                file_type: "application/pdf".into(),
                file_size: 1234,
                file_url: "https://files.test/7".into(),
            }))
        }

        let app = Router::new().route("/api/files/:id", get(describe));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/api")
    }

    #[tokio::test]
    async fn resolves_known_file_and_reports_unknown_as_none() {
        let base = spawn_file_service().await;
        let directory = HttpFileDirectory::new(&base).expect("directory");

        let file = directory.describe(FileId(7)).await.expect("lookup");
        assert_eq!(file.map(|f| f.file_name), Some("roadmap.pdf".to_string()));

        let missing = directory.describe(FileId(8)).await.expect("lookup");
        assert!(missing.is_none());
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(HttpFileDirectory::new("not a url").is_err());
    }
}
