use clap::Parser;
use ninep::srv::srv_async;
use ninep::{io_err, res, Dir, ReadOnly};
use std::path::PathBuf;
use tokio::fs;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Refuse every operation that would change the tree
    #[arg(long)]
    read_only: bool,
}

async fn exportfs_main(
    Cli {
        address,
        exportdir,
        read_only,
    }: Cli,
) -> ninep::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        fs::create_dir_all(&exportdir).await?;
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export path must be a directory"));
    }

    println!("[*] Exporting: {}", exportdir.display());
    println!("[*] Ready to accept clients: {}", address);

    if read_only {
        srv_async(ReadOnly(Dir::new(exportdir)), &address).await?;
    } else {
        srv_async(Dir::new(exportdir), &address).await?;
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = exportfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
