use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use command::{
  binary_on_path, run_command_with_env, run_stage_command,
};
use orbit_client::entities::node::system_bin_dir;

use crate::{
  config::{Branch, InstallConfig},
  error::InstallError,
  helpers::{
    chown_to_service_user, download_file, install_packages,
    phase_done, phase_skipped,
  },
};

const KUBO_VERSION: &str = "v0.32.1";
const RQLITE_VERSION: &str = "v8.36.3";
const GO_VERSION: &str = "1.22.5";
const CLUSTER_MODULE: &str =
  "github.com/ipfs-cluster/ipfs-cluster/cmd/ipfs-cluster-service@v1.1.2";
const OLRICD_MODULE: &str =
  "github.com/olric-data/olric/cmd/olricd@v0.7.0";
const COREDNS_MODULE: &str = "github.com/coredns/coredns@v1.11.3";

/// Source archive of the orbit tree itself, by release channel.
const SOURCE_ARCHIVE: &str =
  "https://github.com/orbit-host/orbit/archive/refs/heads";

fn work_dir() -> PathBuf {
  std::env::temp_dir().join("orbit-install")
}

/// Fetch, verify and install every daemon binary this node runs.
pub async fn run(
  config: &InstallConfig,
) -> Result<(), InstallError> {
  install_external(config)
    .await
    .map_err(InstallError::acquisition)?;
  build_own_binaries(config)
    .await
    .map_err(InstallError::acquisition)?;
  phase_done("Install binaries");
  Ok(())
}

async fn install_external(
  config: &InstallConfig,
) -> anyhow::Result<()> {
  if config.force || !binary_on_path("ipfs").await {
    install_kubo().await.context("Failed to install kubo")?;
  } else {
    phase_skipped("kubo", "already installed");
  }

  if config.force || !binary_on_path("rqlited").await {
    install_rqlite().await.context("Failed to install rqlite")?;
  } else {
    phase_skipped("rqlite", "already installed");
  }

  // No prebuilt artifacts for these; built with the Go toolchain,
  // which is itself bootstrapped on demand.
  let mut go_targets = vec![
    ("ipfs-cluster-service", CLUSTER_MODULE),
    ("olricd", OLRICD_MODULE),
  ];
  if config.nameserver {
    go_targets.push(("coredns", COREDNS_MODULE));
  }
  for (binary, module) in go_targets {
    if !config.force && binary_on_path(binary).await {
      phase_skipped(binary, "already installed");
      continue;
    }
    let go = ensure_go().await?;
    go_install(&go, module)
      .await
      .with_context(|| format!("Failed to build {binary}"))?;
  }

  if config.relay_or_port > 0 && !binary_on_path("tor").await {
    install_packages(&["tor"])
      .await
      .context("Failed to install the privacy relay")?;
  }

  Ok(())
}

fn arch_label() -> &'static str {
  match std::env::consts::ARCH {
    "aarch64" => "arm64",
    _ => "amd64",
  }
}

async fn install_kubo() -> anyhow::Result<()> {
  let arch = arch_label();
  let url = format!(
    "https://dist.ipfs.tech/kubo/{KUBO_VERSION}/kubo_{KUBO_VERSION}_linux-{arch}.tar.gz"
  );
  let work = work_dir();
  let archive = work.join("kubo.tar.gz");
  download_file(&url, &archive).await?;
  run_stage_command(
    "Extract kubo",
    &format!("tar -xzf {} -C {}", archive.display(), work.display()),
    None,
  )
  .await?;
  install_binary(&work.join("kubo").join("ipfs"), "ipfs").await
}

async fn install_rqlite() -> anyhow::Result<()> {
  let arch = arch_label();
  let release = format!("rqlite-{RQLITE_VERSION}-linux-{arch}");
  let url = format!(
    "https://github.com/rqlite/rqlite/releases/download/{RQLITE_VERSION}/{release}.tar.gz"
  );
  let work = work_dir();
  let archive = work.join("rqlite.tar.gz");
  download_file(&url, &archive).await?;
  run_stage_command(
    "Extract rqlite",
    &format!("tar -xzf {} -C {}", archive.display(), work.display()),
    None,
  )
  .await?;
  install_binary(&work.join(&release).join("rqlited"), "rqlited")
    .await?;
  install_binary(&work.join(&release).join("rqlite"), "rqlite").await
}

/// Copy an extracted binary into the system bin dir, mode 0755.
async fn install_binary(
  source: &Path,
  name: &str,
) -> anyhow::Result<()> {
  let dest = system_bin_dir().join(name);
  std::fs::copy(source, &dest).with_context(|| {
    format!("Failed to install {} to {dest:?}", source.display())
  })?;
  run_stage_command(
    "Mark executable",
    &format!("chmod 0755 {}", dest.display()),
    None,
  )
  .await?;
  Ok(())
}

/// Path of a usable `go`, downloading the toolchain when absent.
async fn ensure_go() -> anyhow::Result<String> {
  if binary_on_path("go").await {
    return Ok(String::from("go"));
  }
  let installed = Path::new("/usr/local/go/bin/go");
  if installed.exists() {
    return Ok(installed.display().to_string());
  }
  let arch = arch_label();
  let url =
    format!("https://go.dev/dl/go{GO_VERSION}.linux-{arch}.tar.gz");
  let archive = work_dir().join("go.tar.gz");
  download_file(&url, &archive).await?;
  run_stage_command(
    "Extract go toolchain",
    &format!("tar -xzf {} -C /usr/local", archive.display()),
    None,
  )
  .await?;
  Ok(installed.display().to_string())
}

async fn go_install(go: &str, module: &str) -> anyhow::Result<()> {
  let output = run_command_with_env(
    &format!("{go} install {module}"),
    &[
      ("GOBIN", &system_bin_dir().display().to_string()),
      ("CGO_ENABLED", "0"),
    ],
    None,
  )
  .await;
  if output.success() {
    Ok(())
  } else {
    Err(anyhow!("go install {module} failed | {}", output.combined()))
  }
}

/// Download the orbit source archive for the selected channel, build
/// it, and install the produced binaries for the service user. The
/// HTTPS-terminating daemon additionally gets CAP_NET_BIND_SERVICE.
async fn build_own_binaries(
  config: &InstallConfig,
) -> anyhow::Result<()> {
  let bin_dir = config.paths.bin();
  let orbitd = bin_dir.join("orbitd");
  if orbitd.exists() && !config.force {
    phase_skipped("orbit binaries", "already installed");
    return Ok(());
  }

  let source_dir = fetch_source(config).await?;

  run_stage_command("Build orbit binaries", "make build", source_dir.as_path())
    .await
    .context("make build failed on the orbit source tree")?;

  let built = source_dir.join("bin");
  for binary in ["orbit", "orbitd"] {
    let source = built.join(binary);
    let dest = bin_dir.join(binary);
    std::fs::copy(&source, &dest).with_context(|| {
      format!("build did not produce bin/{binary}")
    })?;
    run_stage_command(
      "Mark executable",
      &format!("chmod 0755 {}", dest.display()),
      None,
    )
    .await?;
  }
  chown_to_service_user(&bin_dir).await;

  run_stage_command(
    "Grant privileged port bind",
    &format!("setcap cap_net_bind_service=+ep {}", orbitd.display()),
    None,
  )
  .await
  .context("Failed to setcap the gateway daemon")?;

  Ok(())
}

/// The archive path is preferred over a clone for resilience against
/// partial clones. Either way the result is a tree rooted at a
/// directory whose Makefile `build` target populates `bin/`.
async fn fetch_source(
  config: &InstallConfig,
) -> anyhow::Result<PathBuf> {
  let source_dir = config.paths.base.join("src");
  if config.no_pull {
    if source_dir.join("Makefile").exists() {
      return Ok(source_dir);
    }
    return Err(anyhow!(
      "--no-pull was passed but {} holds no source tree",
      source_dir.display()
    ));
  }

  let branch = match config.branch {
    Branch::Main => "main",
    Branch::Nightly => "nightly",
  };
  let work = work_dir();
  let archive = work.join(format!("orbit-{branch}.zip"));
  download_file(&format!("{SOURCE_ARCHIVE}/{branch}.zip"), &archive)
    .await?;

  let unpack = work.join("source");
  let _ = std::fs::remove_dir_all(&unpack);
  std::fs::create_dir_all(&unpack)
    .with_context(|| format!("Failed to create {unpack:?}"))?;
  run_stage_command(
    "Unpack source archive",
    &format!("unzip -q {} -d {}", archive.display(), unpack.display()),
    None,
  )
  .await?;

  // The zip wraps the tree in a single `<repo>-<branch>` directory.
  let extracted = std::fs::read_dir(&unpack)
    .with_context(|| format!("Failed to list {unpack:?}"))?
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .find(|path| path.join("Makefile").exists())
    .context("source archive holds no directory with a Makefile")?;

  let _ = std::fs::remove_dir_all(&source_dir);
  run_stage_command(
    "Stage source tree",
    &format!("cp -r {} {}", extracted.display(), source_dir.display()),
    None,
  )
  .await?;
  Ok(source_dir)
}
