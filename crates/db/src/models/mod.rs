pub mod evidence_archive;
