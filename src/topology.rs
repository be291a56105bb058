//! The private API stack
//!
//! A VPC with one public and two private subnets, a NAT gateway for private
//! egress, an internal network load balancer in front of a Fargate service,
//! a private REST API reaching the balancer through a VPC link, a MySQL
//! instance whose connection details live in a secret, and an SSM bastion.
//! Explicit dependencies carry ordering that no property expresses.

use declarative::graph::GraphError;
use declarative::resource::props;
use declarative::{
    ContextKey, Direction, Output, Peer, Reference, Resource, ResourceGraph, ResourceType,
    SecretPayload, SecurityRule, Value, rules,
};

/// Name of the database connection secret
pub const SECRET_NAME: &str = "Sample/Production/DB/Connection";

pub const DATABASE_NAME: &str = "test";
pub const DATABASE_USER: &str = "admin";

const ANYWHERE: &str = "0.0.0.0/0";
const APP_PORT: u16 = 5024;
const CONTAINER_NAME: &str = "odata-app-container";

fn tags(name: &str) -> Value {
    Value::list([Value::map([
        ("key", Value::string("Name")),
        ("value", Value::string(name)),
    ])])
}

fn id(target: &str) -> Value {
    Reference::id(target).into()
}

fn arn(target: &str) -> Value {
    Reference::attr(target, "Arn").into()
}

fn ids(targets: &[&str]) -> Value {
    Value::list(targets.iter().map(|t| id(t)))
}

fn strings(items: &[&str]) -> Value {
    Value::list(items.iter().map(|s| Value::string(*s)))
}

fn statement(actions: &[&str], resource: impl Into<Value>) -> Value {
    Value::map([
        ("Effect", Value::string("Allow")),
        ("Action", strings(actions)),
        ("Resource", resource.into()),
    ])
}

fn document(statements: impl IntoIterator<Item = Value>) -> Value {
    Value::map([
        ("Version", Value::string("2012-10-17")),
        ("Statement", Value::list(statements)),
    ])
}

fn assume_role(service: &str) -> Value {
    document([Value::map([
        ("Effect", Value::string("Allow")),
        ("Principal", Value::map([("Service", Value::string(service))])),
        ("Action", Value::string("sts:AssumeRole")),
    ])])
}

fn inline_policy(name: &str, statements: impl IntoIterator<Item = Value>) -> Value {
    Value::map([
        ("policy_name", Value::string(name)),
        ("policy_document", document(statements)),
    ])
}

fn tcp_from_anywhere(port: u16) -> SecurityRule {
    SecurityRule::tcp(Direction::Ingress, port, Peer::Cidr(ANYWHERE.to_string()))
}

fn all_egress() -> SecurityRule {
    SecurityRule::all(Direction::Egress, Peer::Cidr(ANYWHERE.to_string()))
}

fn security_group(
    id: &str,
    description: &str,
    ingress: &[SecurityRule],
    egress: &[SecurityRule],
) -> Resource {
    let mut group = Resource::new(id, ResourceType::SecurityGroup)
        .with("group_description", description)
        .with(props::VPC_ID, Reference::id("VPC"))
        .with(props::INGRESS, rules::rules_value(ingress));
    if !egress.is_empty() {
        group = group.with(props::EGRESS, rules::rules_value(egress));
    }
    group
}

fn subnet(id: &str, cidr: &str, zone: i64, public: bool) -> Resource {
    Resource::new(id, ResourceType::Subnet)
        .with(props::VPC_ID, Reference::id("VPC"))
        .with("cidr_block", cidr)
        .with("availability_zone_index", zone)
        .with(props::MAP_PUBLIC_IP, public)
        .with("tags", tags(id))
}

fn route_table(id: &str) -> Resource {
    Resource::new(id, ResourceType::RouteTable)
        .with(props::VPC_ID, Reference::id("VPC"))
        .with("tags", tags(id))
}

fn association(id: &str, subnet: &str, table: &str) -> Resource {
    Resource::new(id, ResourceType::SubnetRouteTableAssociation)
        .with(props::SUBNET_ID, Reference::id(subnet))
        .with(props::ROUTE_TABLE_ID, Reference::id(table))
}

fn acl_entry(id: &str, acl: &str, rule_number: i64, egress: bool, from: i64, to: i64) -> Resource {
    Resource::new(id, ResourceType::NetworkAclEntry)
        .with("network_acl_id", Reference::id(acl))
        .with("rule_number", rule_number)
        .with("protocol", -1_i64)
        .with("rule_action", "ALLOW")
        .with("egress", egress)
        .with("cidr_block", ANYWHERE)
        .with(
            "port_range",
            Value::map([("from", Value::Integer(from)), ("to", Value::Integer(to))]),
        )
}

fn network(graph: &mut ResourceGraph) -> Result<(), GraphError> {
    graph.add_resource(
        Resource::new("VPC", ResourceType::Network)
            .with("cidr_block", "10.0.0.0/16")
            .with("enable_dns_support", true)
            .with("enable_dns_hostnames", true)
            .with("tags", tags("ODataVPC")),
    )?;
    graph.add_resource(
        Resource::new("InternetGateway", ResourceType::InternetGateway)
            .with("tags", tags("ODataInternetGateway")),
    )?;
    graph.add_resource(
        Resource::new("AttachGateway", ResourceType::GatewayAttachment)
            .with(props::VPC_ID, Reference::id("VPC"))
            .with("internet_gateway_id", Reference::id("InternetGateway")),
    )?;
    graph.add_resource(Resource::new("EIP", ResourceType::ElasticIp).with("domain", "vpc"))?;

    graph.add_resource(subnet("PublicSubnet", "10.0.0.0/24", 0, true))?;
    graph.add_resource(subnet("PrivateSubnet1", "10.0.1.0/24", 0, false))?;
    graph.add_resource(subnet("PrivateSubnet2", "10.0.2.0/24", 1, false))?;

    graph.add_resource(
        Resource::new("NatGateway", ResourceType::NatGateway)
            .with(props::SUBNET_ID, Reference::id("PublicSubnet"))
            .with("allocation_id", Reference::attr("EIP", "AllocationId")),
    )?;

    graph.add_resource(route_table("PublicRouteTable"))?;
    graph.add_resource(route_table("PrivateRouteTable1"))?;
    graph.add_resource(route_table("PrivateRouteTable2"))?;

    graph.add_resource(
        Resource::new("PublicRoute", ResourceType::Route)
            .with(props::ROUTE_TABLE_ID, Reference::id("PublicRouteTable"))
            .with(props::DESTINATION_CIDR, ANYWHERE)
            .with(props::GATEWAY_ID, Reference::id("InternetGateway")),
    )?;
    for (route, table) in [
        ("PrivateRoute1ToNatGateway", "PrivateRouteTable1"),
        ("PrivateRoute2ToNatGateway", "PrivateRouteTable2"),
    ] {
        graph.add_resource(
            Resource::new(route, ResourceType::Route)
                .with(props::ROUTE_TABLE_ID, Reference::id(table))
                .with(props::DESTINATION_CIDR, ANYWHERE)
                .with(props::NAT_GATEWAY_ID, Reference::id("NatGateway")),
        )?;
    }

    graph.add_resource(association(
        "PublicSubnetRouteTableAssociation",
        "PublicSubnet",
        "PublicRouteTable",
    ))?;
    graph.add_resource(association(
        "PrivateSubnet1RouteTableAssociation",
        "PrivateSubnet1",
        "PrivateRouteTable1",
    ))?;
    graph.add_resource(association(
        "PrivateSubnet2RouteTableAssociation",
        "PrivateSubnet2",
        "PrivateRouteTable2",
    ))?;

    for n in ["1", "2"] {
        let acl = format!("PrivateSubnet{n}NetworkAcl");
        graph.add_resource(
            Resource::new(acl.as_str(), ResourceType::NetworkAcl)
                .with(props::VPC_ID, Reference::id("VPC"))
                .with("tags", tags(&acl)),
        )?;
        graph.add_resource(acl_entry(
            &format!("PrivateSubnet{n}NetworkAclEntryInbound"),
            &acl,
            100,
            false,
            i64::from(APP_PORT),
            i64::from(APP_PORT),
        ))?;
        graph.add_resource(acl_entry(
            &format!("PrivateSubnet{n}NetworkAclEntryOutbound"),
            &acl,
            200,
            true,
            1024,
            65535,
        ))?;
    }
    Ok(())
}

fn security_groups(graph: &mut ResourceGraph) -> Result<(), GraphError> {
    graph.add_resource(
        security_group(
            "BastionSecurityGroup",
            "Bastion Host Security Group",
            &[tcp_from_anywhere(22), tcp_from_anywhere(443), tcp_from_anywhere(80)],
            &[all_egress()],
        )
        .with_public_ingress("bastion host reached over SSH and HTTP(S)"),
    )?;
    graph.add_resource(
        security_group(
            "LoadBalancerSecurityGroup",
            "NLB Security Group",
            &[tcp_from_anywhere(80)],
            &[SecurityRule::tcp(
                Direction::Egress,
                APP_PORT,
                Peer::Cidr(ANYWHERE.to_string()),
            )],
        )
        .with_public_ingress("load balancer listener"),
    )?;
    graph.add_resource(security_group(
        "VPCSecretsManagerEndpointSG",
        "VPC Endpoint Security Group",
        &[tcp_from_anywhere(443)],
        &[],
    ))?;
    graph.add_resource(security_group(
        "ECSClusterSecurityGroup",
        "ECS Cluster Security Group",
        &[SecurityRule::tcp(
            Direction::Ingress,
            APP_PORT,
            Peer::Group(Reference::id("LoadBalancerSecurityGroup")),
        )],
        &[all_egress()],
    ))?;
    graph.add_resource(security_group(
        "RDSSecurityGroup",
        "RDS Security Group",
        &[SecurityRule::tcp(
            Direction::Ingress,
            3306,
            Peer::Group(Reference::id("ECSClusterSecurityGroup")),
        )],
        &[all_egress()],
    ))?;

    for (endpoint, service) in [
        ("VPCSecretsManagerEndpoint", "secretsmanager"),
        ("ApiGatewayVPCEndpoint", "execute-api"),
    ] {
        let mut resource = Resource::new(endpoint, ResourceType::VpcEndpoint)
            .with(props::VPC_ID, Reference::id("VPC"))
            .with(
                "service_name",
                Value::join([
                    Value::string("com.amazonaws."),
                    ContextKey::Region.into(),
                    Value::string(format!(".{service}")),
                ]),
            )
            .with("vpc_endpoint_type", "Interface")
            .with("subnet_ids", ids(&["PrivateSubnet1", "PrivateSubnet2"]))
            .with("security_group_ids", ids(&["VPCSecretsManagerEndpointSG"]));
        if service == "execute-api" {
            resource = resource.with("private_dns_enabled", true);
        }
        graph.add_resource(resource)?;
    }
    Ok(())
}

fn iam(graph: &mut ResourceGraph) -> Result<(), GraphError> {
    graph.add_resource(
        Resource::new("AmazonEC2ContainerServiceAutoscaleRole", ResourceType::Role)
            .with("assume_role_policy_document", assume_role("application-autoscaling.amazonaws.com"))
            .with("path", "/")
            .with(
                "policies",
                Value::list([inline_policy(
                    "ECSAutoScalingPolicy",
                    [statement(
                        &[
                            "cloudwatch:DescribeAlarms",
                            "cloudwatch:PutMetricAlarm",
                            "cloudwatch:DeleteAlarms",
                            "ecs:UpdateService",
                            "ecs:DescribeServices",
                        ],
                        "*",
                    )],
                )]),
            ),
    )?;
    graph.add_resource(
        Resource::new("AuthorizerLambdaRole", ResourceType::Role)
            .with("assume_role_policy_document", assume_role("lambda.amazonaws.com"))
            .with(
                "policies",
                Value::list([inline_policy(
                    "LambdaExecutionPolicy",
                    [
                        statement(
                            &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
                            "arn:aws:logs:*:*:*",
                        ),
                        statement(&["lambda:InvokeFunction"], "*"),
                        statement(
                            &["iam:PassRole"],
                            Value::join([
                                Value::string("arn:aws:iam::"),
                                ContextKey::Account.into(),
                                Value::string(":role/*"),
                            ]),
                        ),
                    ],
                )]),
            ),
    )?;
    graph.add_resource(
        Resource::new("BastionHostRole", ResourceType::Role)
            .with("assume_role_policy_document", assume_role("ec2.amazonaws.com"))
            .with("path", "/")
            .with(
                "managed_policy_arns",
                strings(&["arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore"]),
            )
            .with(
                "policies",
                Value::list([
                    inline_policy(
                        "SSMAccessPolicy",
                        [
                            statement(&["ssm:*", "ec2messages:*", "ssm:DescribeInstanceInformation"], "*"),
                            statement(
                                &[
                                    "ssmmessages:CreateControlChannel",
                                    "ssmmessages:CreateDataChannel",
                                    "ssmmessages:OpenControlChannel",
                                    "ssmmessages:OpenDataChannel",
                                ],
                                "*",
                            ),
                            statement(&["s3:GetEncryptionConfiguration"], "*"),
                            statement(&["kms:Decrypt"], "*"),
                        ],
                    ),
                    inline_policy(
                        "SecretsManagerPolicy",
                        [statement(
                            &["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
                            "*",
                        )],
                    ),
                ]),
            ),
    )?;
    graph.add_resource(
        Resource::new("ECSExecutionRole", ResourceType::Role)
            .with("assume_role_policy_document", assume_role("ecs-tasks.amazonaws.com"))
            .with("path", "/")
            .with(
                "policies",
                Value::list([inline_policy(
                    "ECSExecutionPolicy",
                    [statement(
                        &[
                            "ecr:GetDownloadUrlForLayer",
                            "ecr:BatchGetImage",
                            "ecr:GetAuthorizationToken",
                            "logs:CreateLogStream",
                            "logs:PutLogEvents",
                            "secretsmanager:GetSecretValue",
                            "secretsmanager:DescribeSecret",
                        ],
                        "*",
                    )],
                )]),
            ),
    )?;
    graph.add_resource(
        Resource::new("ECSServiceRole", ResourceType::Role)
            .with("assume_role_policy_document", assume_role("ecs-tasks.amazonaws.com"))
            .with("path", "/")
            .with(
                "policies",
                Value::list([inline_policy(
                    "ECSServicePolicy",
                    [statement(
                        &[
                            "ecs:CreateCluster",
                            "ecs:DeregisterContainerInstance",
                            "ecs:DiscoverPollEndpoint",
                            "ecs:Poll",
                            "ecs:RegisterContainerInstance",
                            "ecs:StartTelemetrySession",
                            "ecs:Submit*",
                            "ec2:AuthorizeSecurityGroupIngress",
                            "ec2:Describe*",
                            "ec2:RevokeSecurityGroupIngress",
                            "elasticloadbalancing:DeregisterInstancesFromLoadBalancer",
                            "elasticloadbalancing:Describe*",
                            "elasticloadbalancing:RegisterInstancesWithLoadBalancer",
                            "logs:CreateLogStream",
                            "logs:PutLogEvents",
                            "secretsmanager:GetSecretValue",
                            "secretsmanager:DescribeSecret",
                        ],
                        "*",
                    )],
                )]),
            ),
    )?;
    graph.add_resource(
        Resource::new("SecretsManagerPolicy", ResourceType::Policy)
            .with("policy_name", "SecretsManagerPolicy")
            .with("roles", ids(&["ECSServiceRole"]))
            .with(
                "policy_document",
                document([statement(
                    &["secretsmanager:GetSecretValue"],
                    Value::join([
                        Value::string("arn:aws:secretsmanager:"),
                        ContextKey::Region.into(),
                        Value::string(":"),
                        ContextKey::Account.into(),
                        Value::string(format!(":secret:{SECRET_NAME}-*")),
                    ]),
                )]),
            ),
    )?;
    graph.add_resource(
        Resource::new("BastionHostInstanceProfile", ResourceType::InstanceProfile)
            .with("roles", ids(&["BastionHostRole"])),
    )?;
    Ok(())
}

fn database(graph: &mut ResourceGraph, db_password: &str) -> Result<(), GraphError> {
    graph.add_resource(
        Resource::new("DBSubnetGroup", ResourceType::DbSubnetGroup)
            .with("db_subnet_group_description", "Subnet group for RDS instance")
            .with("subnet_ids", ids(&["PrivateSubnet1", "PrivateSubnet2"])),
    )?;
    // deleted with the stack, and rolled back if a later stage fails
    graph.add_resource(
        Resource::new("RDSMySQL", ResourceType::Database)
            .with("allocated_storage", "5")
            .with("db_instance_class", "db.t3.micro")
            .with("db_instance_identifier", "db")
            .with("engine", "mysql")
            .with("engine_version", "8.0.33")
            .with("master_username", DATABASE_USER)
            .with(props::MASTER_USER_PASSWORD, Value::sensitive(db_password))
            .with("db_name", DATABASE_NAME)
            .with(props::DB_SECURITY_GROUPS, ids(&["RDSSecurityGroup"]))
            .with("db_subnet_group_name", Reference::id("DBSubnetGroup"))
            .with("publicly_accessible", false)
            .with("multi_az", false)
            .with("deletion_protection", false)
            .ephemeral(),
    )?;
    graph.add_resource(
        Resource::new("SecretsManagerSecret", ResourceType::Secret)
            .with(props::NAME, SECRET_NAME)
            .with("description", "Database connection string")
            .with(
                props::SECRET_STRING,
                SecretPayload::declare(
                    Reference::attr("RDSMySQL", "EndpointAddress").into(),
                    DATABASE_NAME,
                    DATABASE_USER,
                    Value::sensitive(db_password),
                ),
            ),
    )?;
    Ok(())
}

fn compute(graph: &mut ResourceGraph) -> Result<(), GraphError> {
    graph.add_resource(Resource::new("ECS", ResourceType::Cluster))?;
    graph.add_resource(
        Resource::new("SampleLogGroup", ResourceType::LogGroup)
            .with("log_group_name", "/ecs/odata-sample")
            .with("retention_in_days", 7_i64),
    )?;
    graph.add_resource(
        Resource::new("ODataTargetGroup", ResourceType::TargetGroup)
            .with(props::NAME, "odata-target-group")
            .with("target_type", "ip")
            .with("port", i64::from(APP_PORT))
            .with("protocol", "TCP")
            .with(props::VPC_ID, Reference::id("VPC"))
            .with("health_check_protocol", "TCP")
            .with("health_check_port", i64::from(APP_PORT))
            .with("health_check_interval_seconds", 120_i64)
            .with("health_check_timeout_seconds", 30_i64)
            .with("healthy_threshold_count", 5_i64)
            .with("unhealthy_threshold_count", 2_i64),
    )?;
    graph.add_resource(
        Resource::new("NLB", ResourceType::LoadBalancer)
            .with(props::NAME, "odata-nlb")
            .with("subnets", ids(&["PrivateSubnet1", "PrivateSubnet2"]))
            .with("scheme", "internal")
            .with("type", "network"),
    )?;
    graph.add_resource(
        Resource::new("ODataListenerTCP", ResourceType::Listener)
            .with(
                "default_actions",
                Value::list([Value::map([
                    ("type", Value::string("forward")),
                    ("target_group_arn", id("ODataTargetGroup")),
                ])]),
            )
            .with("load_balancer_arn", Reference::id("NLB"))
            .with("port", 80_i64)
            .with("protocol", "TCP"),
    )?;

    let environment = Value::list([
        Value::map([
            ("name", Value::string("ASPNETCORE_ENVIRONMENT")),
            ("value", ContextKey::Environment.into()),
        ]),
        Value::map([
            ("name", Value::string("AWS_REGION")),
            ("value", ContextKey::Region.into()),
        ]),
        Value::map([
            ("name", Value::string("SECRETS_MANAGER_SECRET_NAME")),
            ("value", Value::string(SECRET_NAME)),
        ]),
    ]);
    let container = Value::map([
        ("name", Value::string(CONTAINER_NAME)),
        (
            "image",
            Value::join([
                ContextKey::Account.into(),
                Value::string(".dkr.ecr."),
                ContextKey::Region.into(),
                Value::string(".amazonaws.com/odata-sample:latest"),
            ]),
        ),
        ("essential", Value::Bool(true)),
        (
            "port_mappings",
            Value::list([Value::map([("container_port", Value::Integer(i64::from(APP_PORT)))])]),
        ),
        ("environment", environment),
        (
            "log_configuration",
            Value::map([
                ("log_driver", Value::string("awslogs")),
                (
                    "options",
                    Value::map([
                        ("awslogs-group", Value::string("/ecs/odata-sample")),
                        ("awslogs-region", ContextKey::Region.into()),
                        ("awslogs-stream-prefix", Value::string("odata")),
                    ]),
                ),
            ]),
        ),
    ]);
    graph.add_resource(
        Resource::new("SampleTaskDefinition", ResourceType::TaskDefinition)
            .with("family", "odata-sample")
            .with("network_mode", "awsvpc")
            .with("container_definitions", Value::list([container]))
            .with("requires_compatibilities", strings(&["FARGATE"]))
            .with("cpu", "256")
            .with("memory", "512")
            .with("execution_role_arn", arn("ECSExecutionRole"))
            .with("task_role_arn", arn("ECSServiceRole"))
            .with(
                "runtime_platform",
                Value::map([
                    ("cpu_architecture", Value::string("ARM64")),
                    ("operating_system_family", Value::string("LINUX")),
                ]),
            )
            .depends_on("SecretsManagerPolicy")
            .depends_on("ECSExecutionRole")
            .depends_on("ECSServiceRole"),
    )?;
    graph.add_resource(
        Resource::new("SampleService", ResourceType::Service)
            .with("cluster", Reference::id("ECS"))
            .with("desired_count", 1_i64)
            .with("launch_type", "FARGATE")
            .with("task_definition", Reference::id("SampleTaskDefinition"))
            .with(
                "network_configuration",
                Value::map([
                    ("subnets", ids(&["PrivateSubnet1", "PrivateSubnet2"])),
                    ("security_groups", ids(&["ECSClusterSecurityGroup"])),
                    ("assign_public_ip", Value::string("DISABLED")),
                ]),
            )
            .with(
                "load_balancers",
                Value::list([Value::map([
                    ("container_name", Value::string(CONTAINER_NAME)),
                    ("container_port", Value::Integer(i64::from(APP_PORT))),
                    ("target_group_arn", id("ODataTargetGroup")),
                ])]),
            )
            .depends_on("ODataListenerTCP")
            .depends_on("ECSServiceRole")
            .depends_on("ECSExecutionRole")
            .depends_on("SecretsManagerSecret"),
    )?;
    graph.add_resource(
        Resource::new("ECSServiceScalingTarget", ResourceType::ScalableTarget)
            .with("max_capacity", 10_i64)
            .with("min_capacity", 1_i64)
            .with(
                "resource_id",
                Value::join([
                    Value::string("service/"),
                    id("ECS"),
                    Value::string("/"),
                    id("SampleService"),
                ]),
            )
            .with("role_arn", arn("AmazonEC2ContainerServiceAutoscaleRole"))
            .with("scalable_dimension", "ecs:service:DesiredCount")
            .with("service_namespace", "ecs")
            .depends_on("AmazonEC2ContainerServiceAutoscaleRole"),
    )?;
    graph.add_resource(
        Resource::new("AutoScalingPolicy", ResourceType::ScalingPolicy)
            .with("policy_name", "odata-scaling-policy")
            .with("policy_type", "TargetTrackingScaling")
            .with("scaling_target_id", Reference::id("ECSServiceScalingTarget"))
            .with(
                "target_tracking_scaling_policy_configuration",
                Value::map([
                    (
                        "predefined_metric_specification",
                        Value::map([(
                            "predefined_metric_type",
                            Value::string("ECSServiceAverageCPUUtilization"),
                        )]),
                    ),
                    ("target_value", Value::Integer(50)),
                ]),
            )
            .depends_on("ECSServiceScalingTarget"),
    )?;
    Ok(())
}

const AUTHORIZER_CODE: &str = "exports.handler = async function(event) {
  return {
    principalId: 'user',
    policyDocument: {
      Version: '2012-10-17',
      Statement: [
        { Action: 'execute-api:Invoke', Effect: 'Allow', Resource: event.methodArn }
      ]
    }
  };
};
";

fn api(graph: &mut ResourceGraph) -> Result<(), GraphError> {
    graph.add_resource(
        Resource::new("ApiGatewayRestApi", ResourceType::RestApi)
            .with(props::NAME, "odata-api")
            .with("description", "OData API Gateway")
            .with("endpoint_types", strings(&["PRIVATE"])),
    )?;
    graph.add_resource(
        Resource::new("ApiGatewayResource", ResourceType::ApiResource)
            .with("parent_id", Reference::attr("ApiGatewayRestApi", "RootResourceId"))
            .with("path_part", "odata")
            .with("rest_api_id", Reference::id("ApiGatewayRestApi")),
    )?;
    graph.add_resource(
        Resource::new("AuthorizerLambda", ResourceType::Function)
            .with("handler", "index.handler")
            .with("role", arn("AuthorizerLambdaRole"))
            .with("runtime", "nodejs20.x")
            .with("code", AUTHORIZER_CODE),
    )?;
    graph.add_resource(
        Resource::new("LambdaPermission", ResourceType::Permission)
            .with("action", "lambda:InvokeFunction")
            .with("function_name", Reference::id("AuthorizerLambda"))
            .with("principal", "apigateway.amazonaws.com"),
    )?;
    graph.add_resource(
        Resource::new("ApiGatewayAuthorizer", ResourceType::ApiAuthorizer)
            .with(props::NAME, "Authorizer")
            .with("type", "TOKEN")
            .with(
                "authorizer_uri",
                Value::join([
                    Value::string("arn:aws:apigateway:"),
                    ContextKey::Region.into(),
                    Value::string(":lambda:path/2015-03-31/functions/"),
                    arn("AuthorizerLambda"),
                    Value::string("/invocations"),
                ]),
            )
            .with("identity_source", "method.request.header.Authorization")
            .with("rest_api_id", Reference::id("ApiGatewayRestApi")),
    )?;
    graph.add_resource(
        Resource::new("VPCLink", ResourceType::VpcLink)
            .with(props::NAME, "ODataVpcLink")
            .with("target_arns", ids(&["NLB"])),
    )?;
    graph.add_resource(
        Resource::new("ApiGatewayMethod", ResourceType::ApiMethod)
            .with("authorization_type", "CUSTOM")
            .with("authorizer_id", Reference::id("ApiGatewayAuthorizer"))
            .with("http_method", "ANY")
            .with("resource_id", Reference::id("ApiGatewayResource"))
            .with("rest_api_id", Reference::id("ApiGatewayRestApi"))
            .with(
                "integration",
                Value::map([
                    ("connection_type", Value::string("VPC_LINK")),
                    ("connection_id", id("VPCLink")),
                    ("integration_http_method", Value::string("ANY")),
                    ("type", Value::string("HTTP_PROXY")),
                    (
                        "uri",
                        Value::join([
                            Value::string("http://"),
                            Reference::attr("NLB", "DnsName").into(),
                            Value::string("/odata"),
                        ]),
                    ),
                ]),
            ),
    )?;
    Ok(())
}

fn bastion(graph: &mut ResourceGraph) -> Result<(), GraphError> {
    graph.add_resource(
        Resource::new("BastionHost", ResourceType::Instance)
            .with("instance_type", "t2.micro")
            .with("image_id", "ami-0b72821e2f351e396")
            .with("iam_instance_profile", Reference::id("BastionHostInstanceProfile"))
            .with(
                "network_interfaces",
                Value::list([Value::map([
                    ("associate_public_ip_address", Value::Bool(false)),
                    ("device_index", Value::string("0")),
                    ("group_set", ids(&["BastionSecurityGroup"])),
                    (props::SUBNET_ID, id("PrivateSubnet1")),
                ])]),
            )
            .with("ssm_agent", true)
            .with("tags", tags("BastionHost")),
    )?;
    Ok(())
}

fn outputs(graph: &mut ResourceGraph) -> Result<(), GraphError> {
    for output in [
        Output::new("VPCId", Reference::id("VPC"), "The VPC ID"),
        Output::new("PublicSubnetId", Reference::id("PublicSubnet"), "The public subnet ID"),
        Output::new(
            "PrivateSubnet1Id",
            Reference::id("PrivateSubnet1"),
            "The first private subnet ID",
        ),
        Output::new(
            "PrivateSubnet2Id",
            Reference::id("PrivateSubnet2"),
            "The second private subnet ID",
        ),
        Output::new(
            "RDSInstanceEndpoint",
            Reference::attr("RDSMySQL", "EndpointAddress"),
            "The endpoint of the RDS instance",
        ),
        Output::new(
            "RDSInstancePort",
            Reference::attr("RDSMySQL", "EndpointPort"),
            "The port of the RDS instance",
        ),
    ] {
        graph.add_output(output)?;
    }
    Ok(())
}

/// Declare the whole stack
///
/// `db_password` only ever lands in sensitive values: the database's master
/// password and the connection secret's payload.
pub fn build(db_password: &str) -> Result<ResourceGraph, GraphError> {
    let mut graph = ResourceGraph::new();
    network(&mut graph)?;
    security_groups(&mut graph)?;
    iam(&mut graph)?;
    database(&mut graph, db_password)?;
    compute(&mut graph)?;
    api(&mut graph)?;
    bastion(&mut graph)?;
    outputs(&mut graph)?;
    Ok(graph)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::checker::{self, Rule};
    use declarative::scheduler;

    #[test]
    fn test_topology_is_valid_and_acyclic() {
        let graph = build("hunter2").unwrap();
        assert!(graph.validate().is_empty());
        assert_eq!(graph.outputs().len(), 6);

        let plan = scheduler::plan(&graph).unwrap();
        assert_eq!(plan.resource_count(), graph.len());
        for edge in graph.edges() {
            assert!(
                plan.stage_of(edge.dependency.as_str()) < plan.stage_of(edge.dependent.as_str()),
                "{} must precede {}",
                edge.dependency,
                edge.dependent
            );
        }
    }

    #[test]
    fn test_topology_posture() {
        let graph = build("hunter2").unwrap();
        let violations = checker::check(&graph);
        assert!(!checker::has_blocking(&violations), "{violations:?}");

        // the endpoint group admits 443 from anywhere without a declared role
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, Rule::OpenIngress);
        assert_eq!(violations[0].resource.as_str(), "VPCSecretsManagerEndpointSG");
    }

    #[test]
    fn test_secret_waits_for_database_and_service_for_secret() {
        let graph = build("hunter2").unwrap();
        let plan = scheduler::plan(&graph).unwrap();
        let stage = |id: &str| plan.stage_of(id).unwrap();

        assert!(stage("RDSMySQL") < stage("SecretsManagerSecret"));
        assert!(stage("SecretsManagerSecret") < stage("SampleService"));
        assert!(stage("ECSServiceScalingTarget") < stage("AutoScalingPolicy"));
        assert!(stage("AttachGateway") > stage("VPC"));
    }

    #[test]
    fn test_password_never_displayed() {
        let graph = build("hunter2").unwrap();
        for resource in graph.resources() {
            for value in resource.properties.values() {
                assert!(!value.to_string().contains("hunter2"));
                assert!(!format!("{value:?}").contains("hunter2"));
            }
            if value_has_sensitive(resource) {
                assert!(resource.kind.accepts_sensitive(), "{}", resource.id);
            }
        }
    }

    fn value_has_sensitive(resource: &Resource) -> bool {
        resource.properties.values().any(Value::contains_sensitive)
    }
}
