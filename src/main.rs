use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use courier::config::Config;
use courier::storage::{FilesystemStorage, PassthroughAnonymizer};
use dimse::{
    result_queue, DimseScu, ExportEvent, ExportJob, Exporter, QueryIdentifier, StorageServer,
};

#[derive(Parser, Debug)]
#[command(
    name = "courier",
    about = "DICOM query/retrieve, export and storage node"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "courier.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Verify connectivity with the remote node (C-ECHO)
    Echo,
    /// Query the remote node for studies (C-FIND)
    Find {
        #[arg(long)]
        patient_id: Option<String>,
        #[arg(long)]
        patient_name: Option<String>,
        #[arg(long)]
        accession_number: Option<String>,
        /// YYYYMMDD or YYYYMMDD-YYYYMMDD
        #[arg(long)]
        study_date: Option<String>,
        #[arg(long)]
        modality: Option<String>,
        /// Print matches as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ask the remote node to send a study somewhere (C-MOVE)
    Move {
        #[arg(long)]
        study: String,
        /// Destination AE title; defaults to the local AE title
        #[arg(long)]
        destination: Option<String>,
    },
    /// Send stored patients to the remote node (C-STORE)
    Export {
        /// Patient IDs to send; every stored patient when omitted
        #[arg(long = "patient")]
        patients: Vec<String>,
    },
    /// Run the storage SCP until interrupted
    Listen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    courier::init_logging(&config.logging)?;

    match cli.cmd {
        Cmd::Echo => {
            let scu = DimseScu::new(config.network.clone());
            let remote = config.remote()?;
            if scu.echo(&config.local, remote).await {
                println!("C-ECHO to {} succeeded", remote);
                Ok(())
            } else {
                anyhow::bail!("C-ECHO to {} failed", remote)
            }
        }
        Cmd::Find {
            patient_id,
            patient_name,
            accession_number,
            study_date,
            modality,
            json,
        } => {
            let query = QueryIdentifier::new()
                .with_patient_id(patient_id.unwrap_or_default())
                .with_patient_name(patient_name.unwrap_or_default())
                .with_accession_number(accession_number.unwrap_or_default())
                .with_study_date(study_date.unwrap_or_default())
                .with_modality(modality.unwrap_or_default());

            let scu = DimseScu::new(config.network.clone());
            let studies = scu.find(&config.local, config.remote()?, &query).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&studies)?);
            } else {
                for study in &studies {
                    println!(
                        "{}\t{}\t{}\t{}\t{}\t{}",
                        study.study_instance_uid,
                        study.patient_id,
                        study.patient_name,
                        study.study_date,
                        study.modality,
                        study.study_description
                    );
                }
                println!("{} studies", studies.len());
            }
            Ok(())
        }
        Cmd::Move { study, destination } => {
            let destination = destination.unwrap_or_else(|| config.local.ae_title.clone());
            let scu = DimseScu::new(config.network.clone());
            let outcome = scu
                .move_study(&config.local, config.remote()?, &study, &destination)
                .await;

            for record in &outcome.records {
                println!("{}", record);
            }
            if let Some(e) = outcome.error {
                return Err(e.into());
            }
            match outcome.records.last() {
                Some(last) if last.status == dimse::status::SUCCESS => Ok(()),
                Some(last) => anyhow::bail!("C-MOVE ended with {}", last),
                None => anyhow::bail!("C-MOVE returned no responses"),
            }
        }
        Cmd::Export { patients } => {
            let storage = FilesystemStorage::new(&config.storage.path)?;
            let patient_ids = if patients.is_empty() {
                storage.patient_ids()?
            } else {
                patients
            };

            let job = ExportJob {
                patient_ids,
                storage_root: storage.base_path().to_path_buf(),
                source: config.local.clone(),
                destination: config.remote()?.clone(),
            };

            let (queue, mut events) = result_queue();
            let handle = Exporter::new(config.network.clone()).export_patients(job, queue);

            while let Some(event) = events.recv().await {
                match event {
                    ExportEvent::Progress(p) => println!(
                        "{}: {}/{} sent, {} errors",
                        p.patient_id, p.files_sent, p.files_to_send, p.errors
                    ),
                    ExportEvent::CriticalError { patient_id, error } => {
                        eprintln!("export stopped at patient {}: {}", patient_id, error)
                    }
                }
            }

            let summary = handle.wait().await?;
            println!(
                "{} of {} files sent, {} errors, {} patients skipped",
                summary.files_sent, summary.files_to_send, summary.errors, summary.patients_skipped
            );
            if summary.aborted {
                anyhow::bail!("export aborted");
            }
            Ok(())
        }
        Cmd::Listen => {
            let mut server = StorageServer::new(
                config.listener(),
                &config.storage.path,
                Arc::new(PassthroughAnonymizer),
                config.network.clone(),
            );
            let addr = server.start().await?;
            println!("Listening on {} as {}", addr, config.local.ae_title);

            tokio::signal::ctrl_c().await?;
            server.stop(true).await;
            Ok(())
        }
    }
}
