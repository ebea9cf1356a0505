mod evidence_archive_repo;

pub use evidence_archive_repo::EvidenceArchiveRepo;
