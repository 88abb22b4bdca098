use kube::CustomResourceExt;

fn main() {
    let crds = [
        serde_yaml::to_string(&controller::apis::documentdb_types::DocumentDB::crd()),
        serde_yaml::to_string(&controller::apis::backup_types::Backup::crd()),
        serde_yaml::to_string(&controller::apis::backup_types::ScheduledBackup::crd()),
    ];
    for crd in crds {
        print!("---\n{}", crd.expect("CRD serializes to YAML"));
    }
}
