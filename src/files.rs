//! Static file serving
//! Resolves request paths beneath a route's folder and streams the file back

use crate::error::ProxyError;
use crate::proxy::{empty_body, BoxError, ProxyBody};
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};
use tokio_util::io::ReaderStream;

/// Map a request path onto a regular file inside `<volume>/<folder>`
///
/// Both the folder and the final file must stay inside their roots after symlinks are
/// resolved.
pub async fn resolve_file(
    volume_root: &Path,
    folder: &str,
    request_path: &str,
) -> Result<PathBuf, ProxyError> {
    let decoded = percent_decode_str(request_path)
        .decode_utf8()
        .map_err(|_| ProxyError::FileNotFound(PathBuf::from(request_path)))?;

    let mut relative = PathBuf::new();
    for part in decoded.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(ProxyError::PathTraversal(request_path.to_string())),
            part if part.contains('\0') || part.contains('\\') => {
                return Err(ProxyError::PathTraversal(request_path.to_string()))
            }
            part => relative.push(part),
        }
    }

    // A leading `/` on the folder still means a folder inside the volume
    let mut folder_path = PathBuf::new();
    for component in Path::new(folder).components() {
        match component {
            Component::Normal(part) => folder_path.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ProxyError::PathTraversal(folder.to_string()))
            }
        }
    }

    let not_found = |path: &Path| ProxyError::FileNotFound(path.to_path_buf());

    let volume = tokio::fs::canonicalize(volume_root)
        .await
        .map_err(|_| not_found(volume_root))?;
    let base = volume.join(&folder_path);
    let base = tokio::fs::canonicalize(&base).await.map_err(|_| not_found(&base))?;
    if !base.starts_with(&volume) {
        return Err(ProxyError::PathTraversal(folder.to_string()));
    }

    let candidate = base.join(&relative);
    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| not_found(&candidate))?;
    if !resolved.starts_with(&base) {
        return Err(ProxyError::PathTraversal(request_path.to_string()));
    }

    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| not_found(&resolved))?;
    if !metadata.is_file() {
        return Err(not_found(&resolved));
    }

    Ok(resolved)
}

/// Stream a file with a guessed content type. HEAD gets headers only.
pub async fn serve_file(path: &Path, method: &Method) -> Result<Response<ProxyBody>, ProxyError> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let body = if method == Method::HEAD {
        empty_body()
    } else {
        let stream = ReaderStream::new(file).map_ok(Frame::data);
        BodyExt::map_err(StreamBody::new(stream), BoxError::from).boxed()
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime.as_ref())
        .header(CONTENT_LENGTH, len)
        .body(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn volume() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("site/nested")).unwrap();
        fs::write(dir.path().join("site/index.html"), "<h1>hi</h1>").unwrap();
        fs::write(dir.path().join("site/nested/my file.txt"), "spaced").unwrap();
        fs::write(dir.path().join("secret.txt"), "secret").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_resolves_existing_file() {
        let dir = volume();
        let path = resolve_file(dir.path(), "site", "/index.html").await.unwrap();
        assert!(path.ends_with("site/index.html"));
    }

    #[tokio::test]
    async fn test_percent_decoding() {
        let dir = volume();
        let path = resolve_file(dir.path(), "site", "/nested/my%20file.txt").await.unwrap();
        assert!(path.ends_with("nested/my file.txt"));
    }

    #[tokio::test]
    async fn test_missing_and_directory_are_not_found() {
        let dir = volume();
        assert!(matches!(
            resolve_file(dir.path(), "site", "/missing.html").await,
            Err(ProxyError::FileNotFound(_))
        ));
        assert!(matches!(
            resolve_file(dir.path(), "site", "/nested").await,
            Err(ProxyError::FileNotFound(_))
        ));
        assert!(matches!(
            resolve_file(dir.path(), "absent", "/index.html").await,
            Err(ProxyError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = volume();
        assert!(matches!(
            resolve_file(dir.path(), "site", "/../secret.txt").await,
            Err(ProxyError::PathTraversal(_))
        ));
        assert!(matches!(
            resolve_file(dir.path(), "site", "/%2e%2e/secret.txt").await,
            Err(ProxyError::PathTraversal(_))
        ));
        assert!(matches!(
            resolve_file(dir.path(), "../", "/secret.txt").await,
            Err(ProxyError::PathTraversal(_))
        ));
    }

    #[tokio::test]
    async fn test_folder_with_leading_slash_stays_in_volume() {
        let dir = volume();
        let path = resolve_file(dir.path(), "/site", "/index.html").await.unwrap();
        assert!(path.ends_with("site/index.html"));

        let path = resolve_file(dir.path(), "./site/", "/nested/my%20file.txt").await.unwrap();
        assert!(path.ends_with("nested/my file.txt"));

        assert!(matches!(
            resolve_file(dir.path(), "/site/../..", "/secret.txt").await,
            Err(ProxyError::PathTraversal(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let dir = volume();
        std::os::unix::fs::symlink(dir.path().join("secret.txt"), dir.path().join("site/link"))
            .unwrap();

        assert!(matches!(
            resolve_file(dir.path(), "site", "/link").await,
            Err(ProxyError::PathTraversal(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_file_headers() {
        let dir = volume();
        let path = dir.path().join("site/index.html");

        let response = serve_file(&path, &Method::GET).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "11");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<h1>hi</h1>");
    }
}
