use std::path::{Component, Path, PathBuf};

use chrono::Local;
use rand::Rng;

use crate::RecorderError;

/// Extension every recording and clip file carries
pub const FILE_EXTENSION: &str = "flv";

/// Characters that are invalid in a file name on at least one supported filesystem
const INVALID_CHARS: &[char] = &['"', '<', '>', '|', ':', '*', '?'];
const SEPARATORS: &[char] = &['/', '\\'];

/// Room fields available to filename templates
#[derive(Debug, Clone, Copy)]
pub struct FileNameContext<'a> {
    pub room_id: u64,
    pub streamer_name: &'a str,
    pub title: &'a str,
}

/// Turns filename templates into output paths confined to the work directory
#[derive(Debug, Clone)]
pub struct PathResolver {
    work_dir: PathBuf,
}

impl PathResolver {
    /// Create a resolver rooted at `work_dir`.
    ///
    /// An existing directory is canonicalized; a missing one is made absolute
    /// against the current directory and normalized lexically.
    pub fn new<P: AsRef<Path>>(work_dir: P) -> Result<Self, RecorderError> {
        let work_dir = work_dir.as_ref();
        let work_dir = if work_dir.exists() {
            work_dir.canonicalize()?
        } else if work_dir.is_absolute() {
            normalize(work_dir)
        } else {
            normalize(&std::env::current_dir()?.join(work_dir))
        };

        Ok(Self { work_dir })
    }

    /// Resolve `template` into a fresh, canonicalized output path.
    ///
    /// Falls back to `<workdir>/<roomid>/<roomid>-<date>-<time>-<random>.flv`
    /// when the templated path leaves the work directory or already exists.
    pub fn resolve(&self, template: &str, ctx: &FileNameContext<'_>) -> PathBuf {
        let now = Local::now();
        let date = now.format("%Y%m%d").to_string();
        let time = now.format("%H%M%S").to_string();
        let random = rand::thread_rng().gen_range(100..1000).to_string();

        let mut filename = template
            .replace("{date}", &date)
            .replace("{time}", &time)
            .replace("{random}", &random)
            .replace("{roomid}", &ctx.room_id.to_string())
            .replace("{title}", &sanitize(ctx.title, false))
            .replace("{name}", &sanitize(ctx.streamer_name, false));

        if !has_extension(&filename) {
            filename.push('.');
            filename.push_str(FILE_EXTENSION);
        }

        let filename = sanitize(&filename, true);
        let lexical = normalize(&self.work_dir.join(filename));

        // Symlinks anywhere along the parent chain are followed before the check
        let root = canonicalize_existing(&self.work_dir);
        let path = match lexical.parent().zip(lexical.file_name()) {
            Some((parent, name)) => canonicalize_existing(parent).join(name),
            None => lexical.clone(),
        };
        let inside = path
            .parent()
            .map(|parent| is_within(&root, parent))
            .unwrap_or(false);

        if !inside {
            log::warn!(
                "[room {}] output path {:?} is outside the work directory, using default path",
                ctx.room_id,
                path
            );
            return self.fallback(ctx.room_id, &date, &time, &random);
        }

        if path.exists() {
            log::warn!(
                "[room {}] output path {:?} already exists, using default path",
                ctx.room_id,
                path
            );
            return self.fallback(ctx.room_id, &date, &time, &random);
        }

        path
    }

    fn fallback(&self, room_id: u64, date: &str, time: &str, random: &str) -> PathBuf {
        self.work_dir.join(room_id.to_string()).join(format!(
            "{}-{}-{}-{}.{}",
            room_id, date, time, random, FILE_EXTENSION
        ))
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

/// Strip characters that cannot appear in a file name. Path separators are
/// kept only when `allow_separators` is set.
pub fn sanitize(input: &str, allow_separators: bool) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .filter(|c| !INVALID_CHARS.contains(c))
        .filter(|c| allow_separators || !SEPARATORS.contains(c))
        .collect()
}

fn has_extension(filename: &str) -> bool {
    let suffix = format!(".{}", FILE_EXTENSION);
    filename.len() >= suffix.len()
        && filename
            .get(filename.len() - suffix.len()..)
            .map(|tail| tail.eq_ignore_ascii_case(&suffix))
            .unwrap_or(false)
}

/// Resolve `.` and `..` components without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// components that do not exist yet. `path` must already be normalized.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(mut real) = existing.canonicalize() {
            real.extend(tail.iter().rev());
            return real;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name);
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Whether `child` is `parent` or one of its descendants
fn is_within(parent: &Path, child: &Path) -> bool {
    child.ancestors().any(|ancestor| ancestor == parent)
}
