use clap::Parser;
use musicolet_unboxing::{archive, BackupStore, Period, Ranking, SongRecord};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log every member and query at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Decrypt every member of a backup into a directory.
    Decrypt(Decrypt),
    /// Re-encrypt a decrypted directory into a backup.
    Encrypt(Encrypt),
    /// Print the favourites list.
    Favorites(Favorites),
    /// Print the names of all user playlists.
    Playlists(Backup),
    /// Print the songs of one playlist.
    Playlist(Playlist),
    /// Print the most played songs.
    Top(Top),
    /// Print the estimated total listening time.
    ListeningTime(ListeningTime),
}

#[derive(Debug, Parser)]
struct Backup {
    backup: PathBuf,
}

#[derive(Debug, Parser)]
struct Decrypt {
    backup: PathBuf,

    /// Defaults to the directory containing the backup.
    output: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct Encrypt {
    input: PathBuf,

    output: PathBuf,
}

#[derive(Debug, Parser)]
struct Favorites {
    backup: PathBuf,

    /// Print paths instead of "album - title".
    #[arg(long)]
    paths: bool,
}

#[derive(Debug, Parser)]
struct Playlist {
    backup: PathBuf,

    name: String,

    /// Print the songs as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct Top {
    backup: PathBuf,

    /// Number of songs, 0 for all of them.
    #[arg(short = 'n', long, default_value_t = 10)]
    limit: i64,

    #[arg(long, value_enum, default_value_t = Ranking::Plays)]
    by: Ranking,
}

#[derive(Debug, Parser)]
struct ListeningTime {
    backup: PathBuf,

    #[arg(long, value_enum, default_value_t = Period::AllTime)]
    period: Period,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = apply(cli.command).await {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    };
}

async fn apply(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Decrypt(decrypt) => {
            let output = match decrypt.output {
                Some(output) => output,
                None => decrypt
                    .backup
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_default(),
            };

            if output.is_file() {
                anyhow::bail!("output: {:?} is a file", output);
            }

            let archive = archive::decrypt_archive(&decrypt.backup)?;

            for failure in &archive.failures {
                tracing::info!(name = %failure.name, reason = %failure.reason, "member not decrypted");
            }

            archive::export_members(&archive.members, &output)?;
        }
        Command::Encrypt(encrypt) => {
            if !encrypt.input.is_dir() {
                anyhow::bail!("input: {:?} is not a directory", encrypt.input);
            }

            archive::encrypt_tree(&encrypt.input, &encrypt.output)?;
        }
        Command::Favorites(favorites) => {
            let store = BackupStore::open(&favorites.backup).await?;

            let songs = store.favorites();

            store.close().await?;

            for song in songs? {
                if favorites.paths {
                    println!("{}", song.path);
                } else {
                    println!("{} - {}", song.album, song.title);
                }
            }
        }
        Command::Playlists(backup) => {
            let store = BackupStore::open(&backup.backup).await?;

            for name in store.list_playlist_names() {
                println!("{}", name);
            }

            store.close().await?;
        }
        Command::Playlist(playlist) => {
            let store = BackupStore::open(&playlist.backup).await?;

            let songs = store.get_playlist(&playlist.name);

            store.close().await?;

            print_songs(&songs?, playlist.json)?;
        }
        Command::Top(top) => {
            let store = BackupStore::open(&top.backup).await?;

            let rows = store.top_songs(top.by, top.limit).await;

            store.close().await?;

            println!("title\tartist\tplays\tyear\tmonth\tweek");
            for row in rows? {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    row.title, row.artist, row.plays.all_time, row.plays.year, row.plays.month, row.plays.week
                );
            }
        }
        Command::ListeningTime(listening) => {
            let store = BackupStore::open(&listening.backup).await?;

            let total = store.listening_time(listening.period).await;

            store.close().await?;

            println!("{:.2} h", total? as f64 / 1000.0 / 60.0 / 60.0);
        }
    }

    return Ok(());
}

fn print_songs(songs: &[SongRecord], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(songs)?);
        return Ok(());
    }

    for song in songs {
        println!("{}\t{} - {}", song.path, song.album, song.title);
    }

    return Ok(());
}
