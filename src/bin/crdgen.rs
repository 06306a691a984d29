//! Prints the CustomResourceDefinitions served by the operator as one YAML stream

use elasticsearch_operator::{DormantDatabase, Elasticsearch, ElasticsearchVersion, Snapshot};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        Elasticsearch::crd(),
        DormantDatabase::crd(),
        Snapshot::crd(),
        ElasticsearchVersion::crd(),
    ];
    for (i, crd) in crds.iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
